//! Domain events
//!
//! The closed set of notifications the pipeline carries from native callback
//! threads to application subscribers. Events are immutable once built and
//! cheap to clone so every subscriber gets its own copy.

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::device::{Device, DeviceState};
use crate::transfer::TransferProgress;
use crate::types::{short_hex, EventId, PayloadId, Timestamp};

// ----------------------------------------------------------------------------
// Event Kinds
// ----------------------------------------------------------------------------

/// Event-specific payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    /// A device became visible through discovery
    DeviceFound { device: Device },
    /// Discovery lost sight of a device that was not connecting or connected
    DeviceLost { device: Device },
    /// A peer invited the local side to connect
    ConnectionRequested {
        device: Device,
        /// Opaque context the inviter attached, if the transport carries one
        context: Option<Vec<u8>>,
        /// Short token both sides can compare out of band
        authentication_token: Option<String>,
    },
    /// Outcome of a pending connection request, in either direction
    ConnectionResponded { device: Device, accepted: bool },
    /// Any state transition, carrying the state it left
    DeviceStateChanged {
        device: Device,
        previous: DeviceState,
    },
    /// A connected device went away
    DeviceDisconnected { device: Device },
    /// Bytes arrived from a connected device
    DataReceived {
        device: Device,
        payload_id: Option<PayloadId>,
        data: Vec<u8>,
    },
    /// Progress of an outgoing or incoming payload
    TransferProgress {
        device: Device,
        progress: TransferProgress,
    },
    AdvertisingStateChanged { is_advertising: bool },
    DiscoveringStateChanged { is_discovering: bool },
}

impl EventKind {
    /// Stable name of the variant, used in logs and fingerprints
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::DeviceFound { .. } => "DeviceFound",
            EventKind::DeviceLost { .. } => "DeviceLost",
            EventKind::ConnectionRequested { .. } => "ConnectionRequested",
            EventKind::ConnectionResponded { .. } => "ConnectionResponded",
            EventKind::DeviceStateChanged { .. } => "DeviceStateChanged",
            EventKind::DeviceDisconnected { .. } => "DeviceDisconnected",
            EventKind::DataReceived { .. } => "DataReceived",
            EventKind::TransferProgress { .. } => "TransferProgress",
            EventKind::AdvertisingStateChanged { .. } => "AdvertisingStateChanged",
            EventKind::DiscoveringStateChanged { .. } => "DiscoveringStateChanged",
        }
    }

    /// The device this event concerns, if any
    pub fn device(&self) -> Option<&Device> {
        match self {
            EventKind::DeviceFound { device }
            | EventKind::DeviceLost { device }
            | EventKind::ConnectionRequested { device, .. }
            | EventKind::ConnectionResponded { device, .. }
            | EventKind::DeviceStateChanged { device, .. }
            | EventKind::DeviceDisconnected { device }
            | EventKind::DataReceived { device, .. }
            | EventKind::TransferProgress { device, .. } => Some(device),
            EventKind::AdvertisingStateChanged { .. } | EventKind::DiscoveringStateChanged { .. } => {
                None
            }
        }
    }

    /// Replace the carried device, keeping every other field
    pub fn with_device(self, replacement: Device) -> Self {
        match self {
            EventKind::DeviceFound { .. } => EventKind::DeviceFound {
                device: replacement,
            },
            EventKind::DeviceLost { .. } => EventKind::DeviceLost {
                device: replacement,
            },
            EventKind::ConnectionRequested {
                context,
                authentication_token,
                ..
            } => EventKind::ConnectionRequested {
                device: replacement,
                context,
                authentication_token,
            },
            EventKind::ConnectionResponded { accepted, .. } => EventKind::ConnectionResponded {
                device: replacement,
                accepted,
            },
            EventKind::DeviceStateChanged { previous, .. } => EventKind::DeviceStateChanged {
                device: replacement,
                previous,
            },
            EventKind::DeviceDisconnected { .. } => EventKind::DeviceDisconnected {
                device: replacement,
            },
            EventKind::DataReceived {
                payload_id, data, ..
            } => EventKind::DataReceived {
                device: replacement,
                payload_id,
                data,
            },
            EventKind::TransferProgress { progress, .. } => EventKind::TransferProgress {
                device: replacement,
                progress,
            },
            other => other,
        }
    }
}

// ----------------------------------------------------------------------------
// Domain Event
// ----------------------------------------------------------------------------

/// One immutable notification travelling through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub kind: EventKind,
}

impl DomainEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: EventId::generate(),
            timestamp: Timestamp::now(),
            kind,
        }
    }

    pub fn device_found(device: Device) -> Self {
        Self::new(EventKind::DeviceFound { device })
    }

    pub fn device_lost(device: Device) -> Self {
        Self::new(EventKind::DeviceLost { device })
    }

    pub fn connection_requested(device: Device) -> Self {
        Self::new(EventKind::ConnectionRequested {
            device,
            context: None,
            authentication_token: None,
        })
    }

    pub fn connection_responded(device: Device, accepted: bool) -> Self {
        Self::new(EventKind::ConnectionResponded { device, accepted })
    }

    pub fn state_changed(device: Device, previous: DeviceState) -> Self {
        Self::new(EventKind::DeviceStateChanged { device, previous })
    }

    pub fn device_disconnected(device: Device) -> Self {
        Self::new(EventKind::DeviceDisconnected { device })
    }

    pub fn advertising_changed(is_advertising: bool) -> Self {
        Self::new(EventKind::AdvertisingStateChanged { is_advertising })
    }

    pub fn discovering_changed(is_discovering: bool) -> Self {
        Self::new(EventKind::DiscoveringStateChanged { is_discovering })
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn device(&self) -> Option<&Device> {
        self.kind.device()
    }

    /// Same event id and timestamp with the device swapped out
    pub fn with_device(self, device: Device) -> Self {
        Self {
            id: self.id,
            timestamp: self.timestamp,
            kind: self.kind.with_device(device),
        }
    }
}

impl fmt::Display for DomainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EventKind::DeviceStateChanged { device, previous } => {
                write!(f, "{}: {} {} -> {}", self.name(), device.id, previous, device.state)
            }
            EventKind::ConnectionResponded { device, accepted } => write!(
                f,
                "{}: {} {}",
                self.name(),
                device.id,
                if *accepted { "accepted" } else { "rejected" }
            ),
            EventKind::DataReceived { device, data, .. } => {
                write!(
                    f,
                    "{}: {} ({} bytes, {})",
                    self.name(),
                    device.id,
                    data.len(),
                    short_hex(data)
                )
            }
            EventKind::TransferProgress { device, progress } => {
                write!(f, "{}: {} {}", self.name(), device.id, progress)
            }
            EventKind::AdvertisingStateChanged { is_advertising } => {
                write!(f, "{}: {}", self.name(), is_advertising)
            }
            EventKind::DiscoveringStateChanged { is_discovering } => {
                write!(f, "{}: {}", self.name(), is_discovering)
            }
            other => match other.device() {
                Some(device) => write!(f, "{}: {}", self.name(), device),
                None => f.write_str(self.name()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_device_keeps_identity_and_fields() {
        let provisional = Device::discovered("A", None);
        let event = DomainEvent::new(EventKind::ConnectionRequested {
            device: provisional,
            context: Some(vec![1, 2, 3]),
            authentication_token: Some("4821".into()),
        });
        let id = event.id;

        let mut authoritative = Device::discovered("A", Some("Alice".into()));
        authoritative.state = DeviceState::ConnectionRequestedInbound;
        let restamped = event.with_device(authoritative.clone());

        assert_eq!(restamped.id, id);
        match restamped.kind {
            EventKind::ConnectionRequested {
                device,
                context,
                authentication_token,
            } => {
                assert_eq!(device.state, DeviceState::ConnectionRequestedInbound);
                assert_eq!(context, Some(vec![1, 2, 3]));
                assert_eq!(authentication_token.as_deref(), Some("4821"));
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_session_state_events_carry_no_device() {
        assert!(DomainEvent::advertising_changed(true).device().is_none());
        assert!(DomainEvent::discovering_changed(false).device().is_none());
    }

    #[test]
    fn test_event_ids_are_unique() {
        let a = DomainEvent::device_found(Device::discovered("A", None));
        let b = DomainEvent::device_found(Device::discovered("A", None));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_events_serialize() {
        let event = DomainEvent::connection_responded(Device::discovered("A", None), true);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("ConnectionResponded"));
    }
}
