//! Adapters: raw platform notifications to domain events
//!
//! Adapters are pure. The device an adapted event carries is provisional; the
//! session context reconciles it against the registry and re-stamps the event
//! with the authoritative device before publishing.

use tracing::debug;

use crate::device::{Device, DeviceState};
use crate::event::{DomainEvent, EventKind};
use crate::platform::{ClusterNotification, SessionNotification, SessionPeer, SessionPeerState};
use crate::transfer::{TransferProgress, TransferStatus};
use crate::types::DeviceId;

/// Maps one platform notification shape to at most one domain event
pub trait EventAdapter: Send + Sync {
    type Input;

    /// `None` suppresses a notification that cannot or should not be mapped
    fn transform(&self, input: &Self::Input) -> Option<DomainEvent>;
}

fn non_empty(name: &str) -> Option<String> {
    let trimmed = name.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn provisional(id: &str, name: Option<String>, state: DeviceState) -> Device {
    Device::new(DeviceId::new(id), name, state)
}

/// Progress with more bytes transferred than the known total is malformed
fn is_malformed(bytes_transferred: u64, total_bytes: i64) -> bool {
    total_bytes >= 0 && bytes_transferred > total_bytes as u64
}

// ----------------------------------------------------------------------------
// Cluster Adapter
// ----------------------------------------------------------------------------

/// Adapter for the endpoint-oriented cluster transport
#[derive(Debug, Clone, Default)]
pub struct ClusterAdapter {
    service_id: Option<String>,
}

impl ClusterAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept endpoints advertising `service_id`
    pub fn for_service(service_id: impl Into<String>) -> Self {
        Self {
            service_id: Some(service_id.into()),
        }
    }
}

impl EventAdapter for ClusterAdapter {
    type Input = ClusterNotification;

    fn transform(&self, input: &ClusterNotification) -> Option<DomainEvent> {
        if input.endpoint_id().is_empty() {
            debug!("Dropping cluster notification without endpoint id");
            return None;
        }

        let kind = match input {
            ClusterNotification::EndpointFound {
                endpoint_id,
                endpoint_name,
                service_id,
            } => {
                if let Some(expected) = &self.service_id {
                    if expected != service_id {
                        debug!("Ignoring {} advertising foreign service {}", endpoint_id, service_id);
                        return None;
                    }
                }
                EventKind::DeviceFound {
                    device: provisional(endpoint_id, non_empty(endpoint_name), DeviceState::Discovered),
                }
            }
            ClusterNotification::EndpointLost { endpoint_id } => EventKind::DeviceLost {
                device: provisional(endpoint_id, None, DeviceState::Discovered),
            },
            ClusterNotification::ConnectionInitiated {
                endpoint_id,
                endpoint_name,
                authentication_token,
                is_incoming,
            } => {
                // The requester sees its own handshake echoed back; the
                // outcome arrives later as a connection result.
                if !is_incoming {
                    return None;
                }
                EventKind::ConnectionRequested {
                    device: provisional(
                        endpoint_id,
                        non_empty(endpoint_name),
                        DeviceState::ConnectionRequestedInbound,
                    ),
                    context: None,
                    authentication_token: non_empty(authentication_token),
                }
            }
            ClusterNotification::ConnectionResult {
                endpoint_id,
                status,
            } => EventKind::ConnectionResponded {
                device: provisional(endpoint_id, None, DeviceState::Connected),
                accepted: status.is_success(),
            },
            ClusterNotification::Disconnected { endpoint_id } => EventKind::DeviceDisconnected {
                device: provisional(endpoint_id, None, DeviceState::Connected),
            },
            ClusterNotification::PayloadReceived {
                endpoint_id,
                payload_id,
                bytes,
            } => EventKind::DataReceived {
                device: provisional(endpoint_id, None, DeviceState::Connected),
                payload_id: Some(*payload_id),
                data: bytes.clone(),
            },
            ClusterNotification::PayloadTransferUpdate {
                endpoint_id,
                payload_id,
                bytes_transferred,
                total_bytes,
                status,
            } => {
                if is_malformed(*bytes_transferred, *total_bytes) {
                    debug!(
                        "Dropping malformed progress for payload {}: {} of {}",
                        payload_id, bytes_transferred, total_bytes
                    );
                    return None;
                }
                EventKind::TransferProgress {
                    device: provisional(endpoint_id, None, DeviceState::Connected),
                    progress: TransferProgress::new(
                        *payload_id,
                        *bytes_transferred,
                        (*total_bytes).max(-1),
                        *status,
                    ),
                }
            }
        };
        Some(DomainEvent::new(kind))
    }
}

// ----------------------------------------------------------------------------
// Session Adapter
// ----------------------------------------------------------------------------

/// Adapter for the multi-peer session transport
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionAdapter;

impl SessionAdapter {
    pub fn new() -> Self {
        Self
    }
}

fn peer_device(peer: &SessionPeer, state: DeviceState) -> Device {
    provisional(&peer.id, non_empty(&peer.display_name), state)
}

impl EventAdapter for SessionAdapter {
    type Input = SessionNotification;

    fn transform(&self, input: &SessionNotification) -> Option<DomainEvent> {
        if input.peer().id.is_empty() {
            debug!("Dropping session notification without peer id");
            return None;
        }

        let kind = match input {
            SessionNotification::FoundPeer {
                peer,
                discovery_info,
            } => {
                let mut device = peer_device(peer, DeviceState::Discovered);
                if device.display_name.is_none() {
                    device.display_name = discovery_info.get("name").and_then(|n| non_empty(n));
                }
                EventKind::DeviceFound { device }
            }
            SessionNotification::LostPeer { peer } => EventKind::DeviceLost {
                device: peer_device(peer, DeviceState::Discovered),
            },
            SessionNotification::ReceivedInvitation { peer, context } => {
                EventKind::ConnectionRequested {
                    device: peer_device(peer, DeviceState::ConnectionRequestedInbound),
                    context: context.clone(),
                    authentication_token: None,
                }
            }
            SessionNotification::PeerStateChanged { peer, state } => match state {
                SessionPeerState::Connecting => return None,
                SessionPeerState::Connected => EventKind::ConnectionResponded {
                    device: peer_device(peer, DeviceState::Connected),
                    accepted: true,
                },
                // Covers both a declined invitation and a dropped link; the
                // registry state tells them apart.
                SessionPeerState::NotConnected => EventKind::DeviceDisconnected {
                    device: peer_device(peer, DeviceState::Connected),
                },
            },
            SessionNotification::ReceivedData { peer, bytes } => EventKind::DataReceived {
                device: peer_device(peer, DeviceState::Connected),
                payload_id: None,
                data: bytes.clone(),
            },
            SessionNotification::SendCompleted {
                peer,
                payload_id,
                bytes,
                error,
            } => {
                let total = i64::try_from(*bytes).unwrap_or(i64::MAX);
                let progress = match error {
                    None => TransferProgress::new(*payload_id, *bytes, total, TransferStatus::Success),
                    Some(reason) => {
                        debug!("Send of payload {} failed: {}", payload_id, reason);
                        TransferProgress::new(*payload_id, 0, total, TransferStatus::Failure)
                    }
                };
                EventKind::TransferProgress {
                    device: peer_device(peer, DeviceState::Connected),
                    progress,
                }
            }
        };
        Some(DomainEvent::new(kind))
    }
}
