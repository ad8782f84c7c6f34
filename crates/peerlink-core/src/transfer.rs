//! Transfer progress and the outgoing transfer tracker
//!
//! Native transports report sends as an unbounded stream of push callbacks.
//! [`OutgoingTransfer`] folds that stream into a single awaitable
//! [`TransferCompletion`], plus an inactivity token that fires when the
//! stream goes quiet for longer than the configured window.

use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::errors::TransferError;
use crate::types::PayloadId;

// ----------------------------------------------------------------------------
// Progress Types
// ----------------------------------------------------------------------------

/// Status of one payload transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    InProgress,
    Success,
    Failure,
    Canceled,
}

impl TransferStatus {
    /// Success, Failure and Canceled end a transfer
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferStatus::InProgress)
    }
}

/// Marker for an unknown total size
pub const UNKNOWN_TOTAL: i64 = -1;

/// One progress report for a payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferProgress {
    pub payload_id: PayloadId,
    pub bytes_transferred: u64,
    /// Total size in bytes, or [`UNKNOWN_TOTAL`]
    pub total_bytes: i64,
    pub status: TransferStatus,
}

impl TransferProgress {
    pub fn new(
        payload_id: PayloadId,
        bytes_transferred: u64,
        total_bytes: i64,
        status: TransferStatus,
    ) -> Self {
        Self {
            payload_id,
            bytes_transferred,
            total_bytes,
            status,
        }
    }

    pub fn in_progress(payload_id: PayloadId, bytes_transferred: u64, total_bytes: i64) -> Self {
        Self::new(payload_id, bytes_transferred, total_bytes, TransferStatus::InProgress)
    }

    /// Fraction complete; undefined when the total is unknown or zero
    pub fn fraction(&self) -> Option<f64> {
        if self.total_bytes > 0 {
            Some(self.bytes_transferred as f64 / self.total_bytes as f64)
        } else {
            None
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl fmt::Display for TransferProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fraction() {
            Some(fraction) => write!(
                f,
                "payload {} {:?} {}/{} ({:.0}%)",
                self.payload_id,
                self.status,
                self.bytes_transferred,
                self.total_bytes,
                fraction * 100.0
            ),
            None => write!(
                f,
                "payload {} {:?} {} bytes",
                self.payload_id, self.status, self.bytes_transferred
            ),
        }
    }
}

// ----------------------------------------------------------------------------
// Progress Sink
// ----------------------------------------------------------------------------

/// Receives every accepted progress update of a transfer.
///
/// Called on the thread that delivered the native callback, while the
/// tracker is locked; implementations must not call back into the tracker.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: &TransferProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(&TransferProgress) + Send + Sync,
{
    fn report(&self, progress: &TransferProgress) {
        self(progress)
    }
}

/// Final result of a transfer
pub type TransferResult = Result<TransferProgress, TransferError>;

// ----------------------------------------------------------------------------
// Outgoing Transfer Tracker
// ----------------------------------------------------------------------------

/// Tracks one in-flight send
pub struct OutgoingTransfer {
    payload_id: PayloadId,
    sink: Option<Arc<dyn ProgressSink>>,
    resolver: Mutex<Option<oneshot::Sender<TransferResult>>>,
    last_progress: Mutex<Option<TransferProgress>>,
    activity: Arc<Notify>,
    inactivity: CancellationToken,
    finished: CancellationToken,
}

impl OutgoingTransfer {
    /// Create a tracker and its completion handle.
    ///
    /// With an inactivity timeout a watchdog task is spawned on the current
    /// tokio runtime; without a runtime the inactivity token never fires.
    pub fn new(
        payload_id: PayloadId,
        sink: Option<Arc<dyn ProgressSink>>,
        inactivity_timeout: Option<Duration>,
    ) -> (Arc<Self>, TransferCompletion) {
        let (sender, receiver) = oneshot::channel();
        let transfer = Arc::new(Self {
            payload_id,
            sink,
            resolver: Mutex::new(Some(sender)),
            last_progress: Mutex::new(None),
            activity: Arc::new(Notify::new()),
            inactivity: CancellationToken::new(),
            finished: CancellationToken::new(),
        });

        if let Some(timeout) = inactivity_timeout {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(inactivity_watchdog(
                        payload_id,
                        timeout,
                        transfer.activity.clone(),
                        transfer.inactivity.clone(),
                        transfer.finished.clone(),
                    ));
                }
                Err(_) => warn!(
                    "No async runtime; inactivity timeout disabled for payload {}",
                    payload_id
                ),
            }
        }

        let completion = TransferCompletion {
            payload_id,
            receiver,
        };
        (transfer, completion)
    }

    pub fn payload_id(&self) -> PayloadId {
        self.payload_id
    }

    /// Apply one progress update.
    ///
    /// Returns `false` when the update was ignored: it belongs to another
    /// payload, or the transfer already reached a terminal outcome.
    pub fn on_update(&self, progress: TransferProgress) -> bool {
        if progress.payload_id != self.payload_id {
            debug!(
                "Ignoring progress for payload {} on tracker {}",
                progress.payload_id, self.payload_id
            );
            return false;
        }

        let mut resolver = lock(&self.resolver);
        if resolver.is_none() {
            trace!("Payload {} already resolved, dropping {}", self.payload_id, progress);
            return false;
        }

        if let Some(sink) = &self.sink {
            sink.report(&progress);
        }
        self.activity.notify_one();
        *lock(&self.last_progress) = Some(progress.clone());

        if progress.is_terminal() {
            let result = match progress.status {
                TransferStatus::Success => Ok(progress.clone()),
                TransferStatus::Failure => Err(TransferError::Failed {
                    payload_id: self.payload_id,
                    reason: format!(
                        "transport reported failure after {} bytes",
                        progress.bytes_transferred
                    ),
                }),
                _ => Err(TransferError::Canceled {
                    payload_id: self.payload_id,
                }),
            };
            self.resolve_locked(&mut resolver, result);
        }
        true
    }

    /// Abandon the transfer; `Completion` resolves as canceled.
    ///
    /// Returns `false` if the transfer had already resolved. The native
    /// transport is not asked to abort.
    pub fn cancel(&self) -> bool {
        self.resolve(Err(TransferError::Canceled {
            payload_id: self.payload_id,
        }))
    }

    /// Resolve as failed without a native failure report, e.g. when the
    /// native send call itself errored
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.resolve(Err(TransferError::Failed {
            payload_id: self.payload_id,
            reason: reason.into(),
        }))
    }

    fn resolve(&self, result: TransferResult) -> bool {
        let mut resolver = lock(&self.resolver);
        if resolver.is_none() {
            return false;
        }
        self.resolve_locked(&mut resolver, result);
        true
    }

    fn resolve_locked(
        &self,
        resolver: &mut Option<oneshot::Sender<TransferResult>>,
        result: TransferResult,
    ) {
        if let Some(sender) = resolver.take() {
            debug!("Payload {} resolved: {:?}", self.payload_id, result.as_ref().map(|p| p.status));
            // The completion handle may already be dropped; nothing to report then.
            let _ = sender.send(result);
        }
        self.finished.cancel();
    }

    pub fn is_resolved(&self) -> bool {
        lock(&self.resolver).is_none()
    }

    /// Fires when no update arrived within the inactivity window
    pub fn inactivity_token(&self) -> CancellationToken {
        self.inactivity.clone()
    }

    pub fn last_progress(&self) -> Option<TransferProgress> {
        lock(&self.last_progress).clone()
    }
}

impl Drop for OutgoingTransfer {
    fn drop(&mut self) {
        self.finished.cancel();
    }
}

impl fmt::Debug for OutgoingTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingTransfer")
            .field("payload_id", &self.payload_id)
            .field("resolved", &self.is_resolved())
            .field("inactive", &self.inactivity.is_cancelled())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn inactivity_watchdog(
    payload_id: PayloadId,
    timeout: Duration,
    activity: Arc<Notify>,
    inactivity: CancellationToken,
    finished: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = finished.cancelled() => return,
            _ = activity.notified() => continue,
            _ = tokio::time::sleep(timeout) => {
                warn!("Payload {} inactive for {:?}", payload_id, timeout);
                inactivity.cancel();
                return;
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Completion Handle
// ----------------------------------------------------------------------------

/// Single-await handle resolving with the transfer's terminal outcome
#[derive(Debug)]
pub struct TransferCompletion {
    payload_id: PayloadId,
    receiver: oneshot::Receiver<TransferResult>,
}

impl TransferCompletion {
    pub fn payload_id(&self) -> PayloadId {
        self.payload_id
    }

    /// Non-blocking check; `None` while the transfer is still pending
    pub fn try_outcome(&mut self) -> Option<TransferResult> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(TransferError::Abandoned {
                payload_id: self.payload_id,
            })),
        }
    }
}

impl Future for TransferCompletion {
    type Output = TransferResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let payload_id = self.payload_id;
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TransferError::Abandoned { payload_id })),
            Poll::Pending => Poll::Pending,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pid() -> PayloadId {
        PayloadId::new(42)
    }

    #[test]
    fn test_fraction_requires_known_total() {
        assert_eq!(TransferProgress::in_progress(pid(), 50, 200).fraction(), Some(0.25));
        assert_eq!(TransferProgress::in_progress(pid(), 50, UNKNOWN_TOTAL).fraction(), None);
        assert_eq!(TransferProgress::in_progress(pid(), 0, 0).fraction(), None);
    }

    #[tokio::test]
    async fn test_success_resolves_completion() {
        let (transfer, completion) = OutgoingTransfer::new(pid(), None, None);
        assert!(transfer.on_update(TransferProgress::in_progress(pid(), 10, 20)));
        assert!(transfer.on_update(TransferProgress::new(pid(), 20, 20, TransferStatus::Success)));

        let outcome = completion.await.unwrap();
        assert_eq!(outcome.bytes_transferred, 20);
        assert!(transfer.is_resolved());
    }

    #[tokio::test]
    async fn test_terminal_outcome_is_exclusive() {
        let reports = Arc::new(AtomicUsize::new(0));
        let counter = reports.clone();
        let sink: Arc<dyn ProgressSink> = Arc::new(move |_: &TransferProgress| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (transfer, completion) = OutgoingTransfer::new(pid(), Some(sink), None);

        assert!(transfer.on_update(TransferProgress::new(pid(), 3, 10, TransferStatus::Failure)));
        assert!(!transfer.on_update(TransferProgress::new(pid(), 10, 10, TransferStatus::Success)));
        assert!(!transfer.cancel());

        match completion.await {
            Err(TransferError::Failed { payload_id, .. }) => assert_eq!(payload_id, pid()),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(reports.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_canceled_status_resolves_canceled() {
        let (transfer, completion) = OutgoingTransfer::new(pid(), None, None);
        transfer.on_update(TransferProgress::new(pid(), 0, 10, TransferStatus::Canceled));
        assert!(matches!(completion.await, Err(TransferError::Canceled { .. })));
    }

    #[tokio::test]
    async fn test_foreign_payload_updates_are_ignored() {
        let (transfer, mut completion) = OutgoingTransfer::new(pid(), None, None);
        let other = PayloadId::new(7);
        assert!(!transfer.on_update(TransferProgress::new(other, 1, 1, TransferStatus::Success)));
        assert!(completion.try_outcome().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_signals_but_does_not_fail() {
        let (transfer, mut completion) =
            OutgoingTransfer::new(pid(), None, Some(Duration::from_millis(200)));
        let token = transfer.inactivity_token();

        transfer.on_update(TransferProgress::in_progress(pid(), 1, 100));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!token.is_cancelled());

        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("inactivity token should fire");
        assert!(completion.try_outcome().is_none());

        assert!(transfer.cancel());
        assert!(!transfer.on_update(TransferProgress::new(pid(), 100, 100, TransferStatus::Success)));
        assert!(matches!(completion.await, Err(TransferError::Canceled { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_reset_the_inactivity_window() {
        let (transfer, _completion) =
            OutgoingTransfer::new(pid(), None, Some(Duration::from_millis(200)));
        let token = transfer.inactivity_token();

        for step in 0..5u64 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            transfer.on_update(TransferProgress::in_progress(pid(), step, 10));
            tokio::task::yield_now().await;
        }
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_tracker_abandons_completion() {
        let (transfer, completion) = OutgoingTransfer::new(pid(), None, None);
        drop(transfer);
        assert!(matches!(completion.await, Err(TransferError::Abandoned { .. })));
    }
}
