//! Invitation decisions
//!
//! Exactly one [`InvitationHandler`] decides on inbound connection requests.
//! Installing another handler replaces the current one; handlers are never
//! multicast. Without a handler, or when it defers, the device stays in
//! `ConnectionRequestedInbound` until the application responds explicitly.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use peerlink_core::Device;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::SessionContext;
use crate::managers::ConnectionOrchestrator;
use crate::transport::NativeTransport;

/// An inbound connection request awaiting a decision
#[derive(Debug, Clone, PartialEq)]
pub struct Invitation {
    pub device: Device,
    pub context: Option<Vec<u8>>,
    pub authentication_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationDecision {
    Accept,
    Reject,
    /// Leave the request pending for an explicit response
    Defer,
}

/// The single decision maker for inbound invitations
#[async_trait]
pub trait InvitationHandler: Send + Sync + 'static {
    async fn decide(&self, invitation: &Invitation) -> InvitationDecision;
}

#[async_trait]
impl<F> InvitationHandler for F
where
    F: Fn(&Invitation) -> InvitationDecision + Send + Sync + 'static,
{
    async fn decide(&self, invitation: &Invitation) -> InvitationDecision {
        self(invitation)
    }
}

// ----------------------------------------------------------------------------
// Handler Slot
// ----------------------------------------------------------------------------

/// Holds the currently installed handler
#[derive(Clone, Default)]
pub(crate) struct HandlerSlot {
    handler: Arc<RwLock<Option<Arc<dyn InvitationHandler>>>>,
}

impl HandlerSlot {
    /// Install `handler`, returning whether one was replaced
    pub(crate) fn install(&self, handler: Arc<dyn InvitationHandler>) -> bool {
        let mut slot = self
            .handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let replaced = slot.replace(handler).is_some();
        if replaced {
            warn!("Replacing the installed invitation handler; only one handler decides");
        }
        replaced
    }

    pub(crate) fn clear(&self) -> bool {
        self.handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .is_some()
    }

    pub(crate) fn current(&self) -> Option<Arc<dyn InvitationHandler>> {
        self.handler
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn is_installed(&self) -> bool {
        self.current().is_some()
    }
}

// ----------------------------------------------------------------------------
// Decision Task
// ----------------------------------------------------------------------------

/// Feed invitations to the installed handler until shutdown
pub(crate) async fn run_invitation_task(
    mut invitations: mpsc::UnboundedReceiver<Invitation>,
    slot: HandlerSlot,
    context: Weak<SessionContext>,
    transport: Arc<dyn NativeTransport>,
    shutdown: CancellationToken,
) {
    loop {
        let invitation = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = invitations.recv() => match next {
                Some(invitation) => invitation,
                None => break,
            },
        };

        let Some(handler) = slot.current() else {
            debug!("No invitation handler; {} stays pending", invitation.device.id);
            continue;
        };

        let decision = match AssertUnwindSafe(handler.decide(&invitation))
            .catch_unwind()
            .await
        {
            Ok(decision) => decision,
            Err(_) => {
                error!(
                    "Invitation handler panicked on {}; leaving request pending",
                    invitation.device.id
                );
                InvitationDecision::Defer
            }
        };

        let accept = match decision {
            InvitationDecision::Defer => continue,
            InvitationDecision::Accept => true,
            InvitationDecision::Reject => false,
        };

        let Some(context) = context.upgrade() else { break };
        let orchestrator = ConnectionOrchestrator::new(context, transport.clone());
        info!(
            "Invitation handler {} {}",
            if accept { "accepted" } else { "rejected" },
            invitation.device.id
        );
        if let Err(err) = orchestrator
            .respond_to_connection(&invitation.device.id, accept, &shutdown)
            .await
        {
            warn!("Responding to {} failed: {}", invitation.device.id, err);
        }
    }
    debug!("Invitation task stopped");
}
