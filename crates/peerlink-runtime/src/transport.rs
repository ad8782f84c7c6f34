//! Native transport port
//!
//! The platform SDKs sit behind [`NativeTransport`]. Commands flow in through
//! the trait; notifications flow back through the [`NativeCallbacks`] handed
//! over at registration time.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use peerlink_core::{ClusterNotification, DeviceId, PayloadId, SessionNotification, TransportError};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::context::SessionContext;

// ----------------------------------------------------------------------------
// Command Payloads
// ----------------------------------------------------------------------------

/// Which native family a transport belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Endpoint-oriented cluster/mesh discovery
    Cluster,
    /// Peer-object-oriented multi-peer session
    Session,
}

impl core::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TransportKind::Cluster => write!(f, "cluster"),
            TransportKind::Session => write!(f, "session"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertiseRequest {
    pub local_name: String,
    pub service_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverRequest {
    pub service_id: String,
}

/// Bytes to send, under an id allocated before the native call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPayload {
    pub payload_id: PayloadId,
    pub bytes: Vec<u8>,
}

// ----------------------------------------------------------------------------
// Native Transport Port
// ----------------------------------------------------------------------------

/// Commands the core issues to one native transport
#[async_trait]
pub trait NativeTransport: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    /// Become discoverable; connection notifications go to `callbacks`
    async fn start_advertising(
        &self,
        request: AdvertiseRequest,
        callbacks: NativeCallbacks,
    ) -> Result<(), TransportError>;

    async fn stop_advertising(&self) -> Result<(), TransportError>;

    /// Scan for advertisers; found/lost notifications go to `callbacks`
    async fn start_discovery(
        &self,
        request: DiscoverRequest,
        callbacks: NativeCallbacks,
    ) -> Result<(), TransportError>;

    async fn stop_discovery(&self) -> Result<(), TransportError>;

    async fn request_connection(
        &self,
        device: &DeviceId,
        callbacks: NativeCallbacks,
    ) -> Result<(), TransportError>;

    async fn accept_connection(&self, device: &DeviceId) -> Result<(), TransportError>;

    async fn reject_connection(&self, device: &DeviceId) -> Result<(), TransportError>;

    async fn disconnect(&self, device: &DeviceId) -> Result<(), TransportError>;

    /// Start sending; progress arrives later through the callbacks
    async fn send(&self, device: &DeviceId, payload: OutgoingPayload) -> Result<(), TransportError>;
}

// ----------------------------------------------------------------------------
// Callback Registration
// ----------------------------------------------------------------------------

/// Entry points a native transport calls when something happens.
///
/// Holds only a weak reference to the session, so a transport that keeps
/// its callbacks after teardown cannot keep the pipeline alive. Calls made
/// after the session is gone are silently dropped.
#[derive(Clone)]
pub struct NativeCallbacks {
    context: Weak<SessionContext>,
}

impl NativeCallbacks {
    pub(crate) fn new(context: &Arc<SessionContext>) -> Self {
        Self {
            context: Arc::downgrade(context),
        }
    }

    /// Callbacks bound to nothing; every notification is dropped
    pub fn detached() -> Self {
        Self {
            context: Weak::new(),
        }
    }

    /// Deliver a cluster transport notification
    pub fn cluster(&self, notification: ClusterNotification) {
        match self.context.upgrade() {
            Some(context) => context.handle_cluster(&notification),
            None => trace!("Session gone, dropping {:?}", notification),
        }
    }

    /// Deliver a multi-peer session transport notification
    pub fn session(&self, notification: SessionNotification) {
        match self.context.upgrade() {
            Some(context) => context.handle_session(&notification),
            None => trace!("Session gone, dropping {:?}", notification),
        }
    }

    /// Whether the owning session is still alive
    pub fn is_attached(&self) -> bool {
        self.context.strong_count() > 0
    }
}

impl core::fmt::Debug for NativeCallbacks {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NativeCallbacks")
            .field("attached", &self.is_attached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_callbacks_drop_notifications() {
        let callbacks = NativeCallbacks::detached();
        assert!(!callbacks.is_attached());
        callbacks.cluster(ClusterNotification::EndpointLost {
            endpoint_id: "A".into(),
        });
    }

    #[test]
    fn test_transport_kind_display() {
        assert_eq!(TransportKind::Cluster.to_string(), "cluster");
        assert_eq!(TransportKind::Session.to_string(), "session");
    }
}
