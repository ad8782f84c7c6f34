//! Raw notification shapes raised by the two native transports
//!
//! These mirror what the platform bindings hand over, before any mapping:
//! an endpoint-oriented cluster transport and a peer-object-oriented
//! multi-peer session transport. Adapters in [`crate::pipeline::adapter`]
//! turn them into domain events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::transfer::TransferStatus;
use crate::types::PayloadId;

// ----------------------------------------------------------------------------
// Cluster Transport
// ----------------------------------------------------------------------------

/// Result code of a cluster connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatusCode {
    Ok,
    Rejected,
    Error { code: i32 },
}

impl ConnectionStatusCode {
    pub fn is_success(&self) -> bool {
        matches!(self, ConnectionStatusCode::Ok)
    }
}

/// Notification raised by the cluster (mesh) discovery transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterNotification {
    EndpointFound {
        endpoint_id: String,
        endpoint_name: String,
        service_id: String,
    },
    EndpointLost {
        endpoint_id: String,
    },
    ConnectionInitiated {
        endpoint_id: String,
        endpoint_name: String,
        authentication_token: String,
        /// False when the local side requested the connection
        is_incoming: bool,
    },
    ConnectionResult {
        endpoint_id: String,
        status: ConnectionStatusCode,
    },
    Disconnected {
        endpoint_id: String,
    },
    PayloadReceived {
        endpoint_id: String,
        payload_id: PayloadId,
        bytes: Vec<u8>,
    },
    PayloadTransferUpdate {
        endpoint_id: String,
        payload_id: PayloadId,
        bytes_transferred: u64,
        /// Negative when unknown
        total_bytes: i64,
        status: TransferStatus,
    },
}

impl ClusterNotification {
    pub fn endpoint_id(&self) -> &str {
        match self {
            ClusterNotification::EndpointFound { endpoint_id, .. }
            | ClusterNotification::EndpointLost { endpoint_id }
            | ClusterNotification::ConnectionInitiated { endpoint_id, .. }
            | ClusterNotification::ConnectionResult { endpoint_id, .. }
            | ClusterNotification::Disconnected { endpoint_id }
            | ClusterNotification::PayloadReceived { endpoint_id, .. }
            | ClusterNotification::PayloadTransferUpdate { endpoint_id, .. } => endpoint_id,
        }
    }
}

// ----------------------------------------------------------------------------
// Multi-peer Session Transport
// ----------------------------------------------------------------------------

/// Stable stand-in for a native peer object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionPeer {
    pub id: String,
    pub display_name: String,
}

impl SessionPeer {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Peer state as reported by the session transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPeerState {
    NotConnected,
    Connecting,
    Connected,
}

/// Notification raised by the multi-peer session transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionNotification {
    FoundPeer {
        peer: SessionPeer,
        discovery_info: BTreeMap<String, String>,
    },
    LostPeer {
        peer: SessionPeer,
    },
    ReceivedInvitation {
        peer: SessionPeer,
        context: Option<Vec<u8>>,
    },
    PeerStateChanged {
        peer: SessionPeer,
        state: SessionPeerState,
    },
    ReceivedData {
        peer: SessionPeer,
        bytes: Vec<u8>,
    },
    /// The session transport reports a send only once, when it finishes
    SendCompleted {
        peer: SessionPeer,
        payload_id: PayloadId,
        bytes: u64,
        error: Option<String>,
    },
}

impl SessionNotification {
    pub fn peer(&self) -> &SessionPeer {
        match self {
            SessionNotification::FoundPeer { peer, .. }
            | SessionNotification::LostPeer { peer }
            | SessionNotification::ReceivedInvitation { peer, .. }
            | SessionNotification::PeerStateChanged { peer, .. }
            | SessionNotification::ReceivedData { peer, .. }
            | SessionNotification::SendCompleted { peer, .. } => peer,
        }
    }
}
