//! Device model and connection state machine
//!
//! A device is identified by its id alone. State and last-seen time are
//! mutable in place and take no part in equality, so a device found twice
//! with the same id and name compares equal across snapshots.

use core::fmt;
use core::hash::{Hash, Hasher};
use serde::{Deserialize, Serialize};

use crate::types::{DeviceId, Timestamp};

// ----------------------------------------------------------------------------
// Device State
// ----------------------------------------------------------------------------

/// Position of a device in the connection lifecycle.
///
/// There is no disconnected resting state: a device that disconnects or is
/// lost leaves the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    /// Visible through discovery, no connection in progress
    Discovered,
    /// The local side asked the peer to connect and awaits an answer
    ConnectionRequestedOutbound,
    /// The peer invited the local side and awaits a local decision
    ConnectionRequestedInbound,
    /// Both sides accepted
    Connected,
}

impl DeviceState {
    /// Whether a connection request is pending in either direction
    pub fn is_requested(&self) -> bool {
        matches!(
            self,
            DeviceState::ConnectionRequestedOutbound | DeviceState::ConnectionRequestedInbound
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, DeviceState::Connected)
    }

    /// Whether `next` is reachable from this state in one step
    pub fn can_transition_to(&self, next: DeviceState) -> bool {
        use DeviceState::*;
        matches!(
            (self, next),
            (Discovered, ConnectionRequestedOutbound)
                | (Discovered, ConnectionRequestedInbound)
                | (ConnectionRequestedOutbound, Connected)
                | (ConnectionRequestedInbound, Connected)
                | (ConnectionRequestedOutbound, Discovered)
                | (ConnectionRequestedInbound, Discovered)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeviceState::Discovered => "Discovered",
            DeviceState::ConnectionRequestedOutbound => "ConnectionRequestedOutbound",
            DeviceState::ConnectionRequestedInbound => "ConnectionRequestedInbound",
            DeviceState::Connected => "Connected",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ----------------------------------------------------------------------------
// Device
// ----------------------------------------------------------------------------

/// One remote peer as seen by the local side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub display_name: Option<String>,
    pub state: DeviceState,
    pub last_seen_at: Timestamp,
}

impl Device {
    pub fn new(id: DeviceId, display_name: Option<String>, state: DeviceState) -> Self {
        Self {
            id,
            display_name,
            state,
            last_seen_at: Timestamp::now(),
        }
    }

    /// Device as first seen through discovery
    pub fn discovered(id: impl Into<DeviceId>, display_name: Option<String>) -> Self {
        Self::new(id.into(), display_name, DeviceState::Discovered)
    }

    /// Human-readable label, falling back to the id
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(self.id.as_str())
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.display_name == other.display_name
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{} ({}) [{}]", name, self.id, self.state),
            None => write!(f, "{} [{}]", self.id, self.state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_equality_ignores_mutable_fields() {
        let a = Device::discovered("A", Some("Alice".to_string()));
        let mut b = a.clone();
        b.state = DeviceState::Connected;
        b.last_seen_at = b.last_seen_at + 10_000;
        assert_eq!(a, b);

        let renamed = Device::discovered("A", Some("Alicia".to_string()));
        assert_ne!(a, renamed);

        let set: HashSet<Device> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_state_machine_edges() {
        use DeviceState::*;
        assert!(Discovered.can_transition_to(ConnectionRequestedOutbound));
        assert!(Discovered.can_transition_to(ConnectionRequestedInbound));
        assert!(ConnectionRequestedOutbound.can_transition_to(Connected));
        assert!(ConnectionRequestedInbound.can_transition_to(Discovered));
        assert!(!Discovered.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Discovered));
        assert!(!Connected.can_transition_to(ConnectionRequestedInbound));
    }

    #[test]
    fn test_label_falls_back_to_id() {
        assert_eq!(Device::discovered("B", None).label(), "B");
        assert_eq!(Device::discovered("B", Some("Bob".into())).label(), "Bob");
    }
}
