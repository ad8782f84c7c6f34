//! Advertising and discovery session managers
//!
//! Each manager guards one native activity. Start fails while the activity
//! is running; stop is idempotent. Both are serialized through a mutex owned
//! by the manager alone, held only across the native call and the flag
//! update. The two managers never share a lock.

use core::future::Future;
use core::time::Duration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use peerlink_core::{DomainEvent, PeerlinkError, Result, SessionKind, TransportError};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::context::SessionContext;
use crate::transport::{AdvertiseRequest, DiscoverRequest, NativeCallbacks, NativeTransport};

// ----------------------------------------------------------------------------
// Activity Gate
// ----------------------------------------------------------------------------

/// Single-activity start/stop discipline shared by both managers
#[derive(Debug)]
struct ActivityGate {
    kind: SessionKind,
    active: Mutex<bool>,
    /// Mirror of `active` readable without waiting on the mutex
    observed: AtomicBool,
}

impl ActivityGate {
    fn new(kind: SessionKind) -> Self {
        Self {
            kind,
            active: Mutex::new(false),
            observed: AtomicBool::new(false),
        }
    }

    fn operation(&self, starting: bool) -> &'static str {
        match (self.kind, starting) {
            (SessionKind::Advertising, true) => "start advertising",
            (SessionKind::Advertising, false) => "stop advertising",
            (SessionKind::Discovery, true) => "start discovery",
            (SessionKind::Discovery, false) => "stop discovery",
        }
    }

    fn state_event(&self, active: bool) -> DomainEvent {
        match self.kind {
            SessionKind::Advertising => DomainEvent::advertising_changed(active),
            SessionKind::Discovery => DomainEvent::discovering_changed(active),
        }
    }

    fn is_active(&self) -> bool {
        self.observed.load(Ordering::Acquire)
    }

    async fn lock(
        &self,
        cancel: &CancellationToken,
        operation: &'static str,
    ) -> Result<MutexGuard<'_, bool>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PeerlinkError::Canceled { operation }),
            guard = self.active.lock() => Ok(guard),
        }
    }

    fn set(&self, guard: &mut MutexGuard<'_, bool>, context: &SessionContext, active: bool) {
        **guard = active;
        self.observed.store(active, Ordering::Release);
        context.emit(self.state_event(active));
    }

    async fn start<S, U, UF>(
        &self,
        context: &SessionContext,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
        native_start: S,
        native_undo: U,
    ) -> Result<()>
    where
        S: Future<Output = core::result::Result<(), TransportError>>,
        U: FnOnce() -> UF,
        UF: Future<Output = core::result::Result<(), TransportError>>,
    {
        let operation = self.operation(true);
        let mut active = self.lock(cancel, operation).await?;
        if *active {
            debug!("Rejecting {}: already active", operation);
            return Err(PeerlinkError::AlreadyActive { session: self.kind });
        }

        let attempt = async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, native_start)
                    .await
                    .map_err(|_| TransportError::Timeout {
                        operation: operation.to_string(),
                        duration_ms: limit.as_millis() as u64,
                    })
                    .and_then(|result| result),
                None => native_start.await,
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = attempt => Some(result),
        };

        match outcome {
            Some(Ok(())) => {
                self.set(&mut active, context, true);
                info!("{} session started", self.kind);
                Ok(())
            }
            Some(Err(err)) => {
                warn!("Native {} failed: {}", operation, err);
                if matches!(err, TransportError::Timeout { .. }) {
                    // The native side may still come up after we gave up on it.
                    if let Err(undo_err) = native_undo().await {
                        debug!("Best-effort stop after timeout failed: {}", undo_err);
                    }
                }
                Err(err.into())
            }
            None => {
                debug!("{} canceled before the native start completed", operation);
                if let Err(undo_err) = native_undo().await {
                    debug!("Best-effort stop after cancel failed: {}", undo_err);
                }
                Err(PeerlinkError::Canceled { operation })
            }
        }
    }

    async fn stop<F>(&self, context: &SessionContext, cancel: &CancellationToken, native_stop: F) -> Result<()>
    where
        F: Future<Output = core::result::Result<(), TransportError>>,
    {
        let operation = self.operation(false);
        let mut active = match self.active.try_lock() {
            Ok(guard) => guard,
            Err(_) => self.lock(cancel, operation).await?,
        };
        if !*active {
            trace!("{} while inactive is a no-op", operation);
            return Ok(());
        }

        if let Err(err) = native_stop.await {
            warn!("Native {} failed: {}; marking inactive anyway", operation, err);
        }
        self.set(&mut active, context, false);
        info!("{} session stopped", self.kind);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Advertising Manager
// ----------------------------------------------------------------------------

/// Owns the single native advertising activity
pub struct AdvertisingManager {
    gate: ActivityGate,
    context: Arc<SessionContext>,
    transport: Arc<dyn NativeTransport>,
    start_timeout: Option<Duration>,
}

impl AdvertisingManager {
    pub(crate) fn new(
        context: Arc<SessionContext>,
        transport: Arc<dyn NativeTransport>,
        start_timeout: Option<Duration>,
    ) -> Self {
        Self {
            gate: ActivityGate::new(SessionKind::Advertising),
            context,
            transport,
            start_timeout,
        }
    }

    /// Start advertising; fails with `AlreadyActive` if already running
    pub async fn start(&self, request: AdvertiseRequest, cancel: &CancellationToken) -> Result<()> {
        debug!("Advertising as {} for {}", request.local_name, request.service_id);
        let callbacks = NativeCallbacks::new(&self.context);
        self.gate
            .start(
                &self.context,
                cancel,
                self.start_timeout,
                self.transport.start_advertising(request, callbacks),
                || self.transport.stop_advertising(),
            )
            .await
    }

    /// Stop advertising; a no-op when not advertising
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        self.gate
            .stop(&self.context, cancel, self.transport.stop_advertising())
            .await
    }

    pub fn is_active(&self) -> bool {
        self.gate.is_active()
    }
}

impl core::fmt::Debug for AdvertisingManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AdvertisingManager")
            .field("active", &self.is_active())
            .field("transport", &self.transport.kind())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Discovery Manager
// ----------------------------------------------------------------------------

/// Owns the single native discovery activity
pub struct DiscoveryManager {
    gate: ActivityGate,
    context: Arc<SessionContext>,
    transport: Arc<dyn NativeTransport>,
    start_timeout: Option<Duration>,
}

impl DiscoveryManager {
    pub(crate) fn new(
        context: Arc<SessionContext>,
        transport: Arc<dyn NativeTransport>,
        start_timeout: Option<Duration>,
    ) -> Self {
        Self {
            gate: ActivityGate::new(SessionKind::Discovery),
            context,
            transport,
            start_timeout,
        }
    }

    /// Start discovery; fails with `AlreadyActive` if already running
    pub async fn start(&self, request: DiscoverRequest, cancel: &CancellationToken) -> Result<()> {
        debug!("Discovering service {}", request.service_id);
        let callbacks = NativeCallbacks::new(&self.context);
        self.gate
            .start(
                &self.context,
                cancel,
                self.start_timeout,
                self.transport.start_discovery(request, callbacks),
                || self.transport.stop_discovery(),
            )
            .await
    }

    /// Stop discovery; a no-op when not discovering
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        self.gate
            .stop(&self.context, cancel, self.transport.stop_discovery())
            .await
    }

    pub fn is_active(&self) -> bool {
        self.gate.is_active()
    }
}

impl core::fmt::Debug for DiscoveryManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DiscoveryManager")
            .field("active", &self.is_active())
            .field("transport", &self.transport.kind())
            .finish()
    }
}
