//! Connection orchestrator
//!
//! Drives the device state machine for commands issued by the application:
//! request, respond, disconnect and send. Registry mutations happen before
//! the matching events are emitted; native failures roll the registry back.

use core::future::Future;
use std::sync::Arc;

use peerlink_core::{
    DeviceId, DeviceState, DomainEvent, OutgoingTransfer, PeerlinkError, Result, TransitionOutcome,
    TransportError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::delivery::{SendOptions, TransferHandle};
use crate::context::SessionContext;
use crate::transport::{NativeCallbacks, NativeTransport, OutgoingPayload};

/// Run a native command unless `cancel` fires first
async fn native<F>(cancel: &CancellationToken, operation: &'static str, call: F) -> Result<()>
where
    F: Future<Output = core::result::Result<(), TransportError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PeerlinkError::Canceled { operation }),
        result = call => result.map_err(PeerlinkError::from),
    }
}

/// Connection state machine driver
#[derive(Clone)]
pub struct ConnectionOrchestrator {
    context: Arc<SessionContext>,
    transport: Arc<dyn NativeTransport>,
}

impl ConnectionOrchestrator {
    pub(crate) fn new(context: Arc<SessionContext>, transport: Arc<dyn NativeTransport>) -> Self {
        Self { context, transport }
    }

    fn require_state(&self, id: &DeviceId, expected: DeviceState, operation: &'static str) -> Result<()> {
        match self.context.registry().state(id) {
            None => Err(PeerlinkError::device_not_found(id.as_str())),
            Some(state) if state == expected => Ok(()),
            Some(state) => Err(PeerlinkError::invalid_transition(id.as_str(), state, operation)),
        }
    }

    /// Ask a discovered device to connect.
    ///
    /// The device moves to `ConnectionRequestedOutbound` before the native
    /// call; the peer's answer arrives later as a notification.
    pub async fn request_connection(&self, id: &DeviceId, cancel: &CancellationToken) -> Result<()> {
        const OPERATION: &str = "request connection";
        if cancel.is_cancelled() {
            return Err(PeerlinkError::Canceled { operation: OPERATION });
        }

        match self.context.registry().transition_if(
            id,
            |state| state == DeviceState::Discovered,
            DeviceState::ConnectionRequestedOutbound,
        ) {
            TransitionOutcome::Missing => return Err(PeerlinkError::device_not_found(id.as_str())),
            TransitionOutcome::Rejected(device) => {
                return Err(PeerlinkError::invalid_transition(id.as_str(), device.state, OPERATION))
            }
            TransitionOutcome::Applied(change) => {
                self.context
                    .emit(DomainEvent::state_changed(change.device, change.previous));
            }
        }

        let callbacks = NativeCallbacks::new(&self.context);
        match native(cancel, OPERATION, self.transport.request_connection(id, callbacks)).await {
            Ok(()) => {
                info!("Requested connection to {}", id);
                Ok(())
            }
            Err(err) => {
                warn!("Connection request to {} failed: {}", id, err);
                self.context.emit_all(self.context.resolve_rejection(id));
                Err(err)
            }
        }
    }

    /// Accept or decline a pending inbound request.
    ///
    /// The registry only moves once the native command succeeded, so a failed
    /// command leaves the request pending.
    pub async fn respond_to_connection(
        &self,
        id: &DeviceId,
        accept: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if accept {
            self.require_state(id, DeviceState::ConnectionRequestedInbound, "accept")?;
            native(cancel, "accept connection", self.transport.accept_connection(id)).await?;

            let events = self.context.complete_connection(id);
            if events.is_empty() {
                debug!(
                    "{} left the pending state while accepting (now {:?})",
                    id,
                    self.context.registry().state(id)
                );
            }
            self.context.emit_all(events);
            info!("Accepted connection from {}", id);
        } else {
            self.require_state(id, DeviceState::ConnectionRequestedInbound, "reject")?;
            native(cancel, "reject connection", self.transport.reject_connection(id)).await?;
            self.context.emit_all(self.context.resolve_rejection(id));
            info!("Rejected connection from {}", id);
        }
        Ok(())
    }

    /// Disconnect a connected device.
    ///
    /// The device is removed and `DeviceDisconnected` emitted even when the
    /// native call fails or is canceled; the native error is returned after.
    pub async fn disconnect(&self, id: &DeviceId, cancel: &CancellationToken) -> Result<()> {
        self.require_state(id, DeviceState::Connected, "disconnect")?;

        let result = native(cancel, "disconnect", self.transport.disconnect(id)).await;
        if let Err(err) = &result {
            warn!("Native disconnect of {} failed: {}; removing anyway", id, err);
        }
        self.context.emit_all(self.context.on_disconnected(id));
        info!("Disconnected {}", id);
        result
    }

    /// Send `bytes` to a connected device
    pub async fn send(
        &self,
        id: &DeviceId,
        bytes: Vec<u8>,
        options: SendOptions,
        cancel: &CancellationToken,
    ) -> Result<TransferHandle> {
        let config = self.context.transfer_config();
        if bytes.len() > config.max_payload_bytes {
            return Err(PeerlinkError::PayloadTooLarge {
                size: bytes.len(),
                limit: config.max_payload_bytes,
            });
        }
        self.require_state(id, DeviceState::Connected, "send to")?;

        let payload_id = self.context.allocate_payload_id();
        let timeout = options.resolve_timeout(config.inactivity_timeout());
        let (transfer, completion) = OutgoingTransfer::new(payload_id, options.progress, timeout);
        self.context.register_transfer(id.clone(), transfer.clone());
        debug!("Sending payload {} ({} bytes) to {}", payload_id, bytes.len(), id);

        let payload = OutgoingPayload { payload_id, bytes };
        match native(cancel, "send", self.transport.send(id, payload)).await {
            Ok(()) => Ok(TransferHandle::new(id.clone(), transfer, completion)),
            Err(err) => {
                match &err {
                    PeerlinkError::Canceled { .. } => {
                        transfer.cancel();
                    }
                    other => {
                        transfer.fail(other.to_string());
                    }
                }
                self.context.unregister_transfer(&payload_id);
                Err(err)
            }
        }
    }
}

impl core::fmt::Debug for ConnectionOrchestrator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectionOrchestrator")
            .field("transport", &self.transport.kind())
            .finish()
    }
}
