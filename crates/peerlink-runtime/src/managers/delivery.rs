//! Outgoing payload handles
//!
//! A send hands back a [`TransferHandle`]: the tracker registered with the
//! session plus its single-await completion.

use core::time::Duration;
use std::sync::Arc;

use peerlink_core::{
    DeviceId, OutgoingTransfer, PayloadId, ProgressSink, TransferCompletion, TransferError,
    TransferProgress, TransferResult,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Per-send options
#[derive(Clone, Default)]
pub struct SendOptions {
    /// Overrides the configured inactivity window; `Duration::ZERO` disables it
    pub inactivity_timeout: Option<Duration>,
    pub progress: Option<Arc<dyn ProgressSink>>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = Some(timeout);
        self
    }

    pub fn with_progress<S: ProgressSink + 'static>(mut self, sink: S) -> Self {
        self.progress = Some(Arc::new(sink));
        self
    }

    /// Effective inactivity window given the configured default
    pub(crate) fn resolve_timeout(&self, default: Option<Duration>) -> Option<Duration> {
        match self.inactivity_timeout {
            Some(timeout) if timeout.is_zero() => None,
            Some(timeout) => Some(timeout),
            None => default,
        }
    }
}

impl core::fmt::Debug for SendOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SendOptions")
            .field("inactivity_timeout", &self.inactivity_timeout)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// One in-flight send
#[derive(Debug)]
pub struct TransferHandle {
    device_id: DeviceId,
    transfer: Arc<OutgoingTransfer>,
    completion: TransferCompletion,
}

impl TransferHandle {
    pub(crate) fn new(
        device_id: DeviceId,
        transfer: Arc<OutgoingTransfer>,
        completion: TransferCompletion,
    ) -> Self {
        Self {
            device_id,
            transfer,
            completion,
        }
    }

    pub fn payload_id(&self) -> PayloadId {
        self.transfer.payload_id()
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn transfer(&self) -> &Arc<OutgoingTransfer> {
        &self.transfer
    }

    /// Fires when the transport went quiet for the inactivity window
    pub fn inactivity_token(&self) -> CancellationToken {
        self.transfer.inactivity_token()
    }

    /// Abandon the send; the native transport is not asked to abort
    pub fn cancel(&self) -> bool {
        self.transfer.cancel()
    }

    pub fn last_progress(&self) -> Option<TransferProgress> {
        self.transfer.last_progress()
    }

    /// Non-blocking look at the outcome
    pub fn try_outcome(&mut self) -> Option<TransferResult> {
        self.completion.try_outcome()
    }

    pub fn into_completion(self) -> TransferCompletion {
        self.completion
    }

    /// Wait for the terminal outcome, however long the transport takes
    pub async fn finish(self) -> TransferResult {
        self.completion.await
    }

    /// Wait for the terminal outcome, abandoning the send if the transport
    /// goes quiet for the inactivity window
    pub async fn finish_or_abandon(self) -> TransferResult {
        let Self {
            transfer,
            mut completion,
            ..
        } = self;
        let inactivity = transfer.inactivity_token();
        tokio::select! {
            biased;
            result = &mut completion => result,
            _ = inactivity.cancelled() => {
                warn!("Abandoning payload {} after inactivity", transfer.payload_id());
                transfer.cancel();
                Err(TransferError::Abandoned { payload_id: transfer.payload_id() })
            }
        }
    }
}
