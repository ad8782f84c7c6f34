//! Device registry
//!
//! The single source of truth for which peers are known and where each one
//! sits in the connection state machine. Backed by a sharded concurrent map so
//! native callback threads and application tasks can mutate it without a
//! global lock. Every operation is total over the id space: unknown ids yield
//! `None` rather than an error, since discovery/loss races are routine.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use crate::device::{Device, DeviceState};
use crate::types::{DeviceId, SystemTimeSource, TimeSource};

// ----------------------------------------------------------------------------
// Registry Results
// ----------------------------------------------------------------------------

/// Result of a discovery or first-contact observation
#[derive(Debug, Clone)]
pub struct Observation {
    /// Snapshot of the device after the observation
    pub device: Device,
    /// True when the device was created, or was previously marked not visible
    pub is_new: bool,
}

/// A state change applied to one device
#[derive(Debug, Clone)]
pub struct StateChange {
    pub device: Device,
    pub previous: DeviceState,
}

impl StateChange {
    /// Whether the state actually moved; equal states publish nothing
    pub fn is_change(&self) -> bool {
        self.previous != self.device.state
    }
}

/// Outcome of a guarded transition
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied(StateChange),
    /// The device exists but its current state did not satisfy the guard
    Rejected(Device),
    Missing,
}

#[derive(Debug, Clone)]
struct RegistryEntry {
    device: Device,
    /// Cleared when discovery loses sight of a device that is mid-connection
    visible: bool,
}

// ----------------------------------------------------------------------------
// Device Registry
// ----------------------------------------------------------------------------

/// Concurrent registry of known devices
pub struct DeviceRegistry {
    entries: DashMap<DeviceId, RegistryEntry>,
    time_source: Box<dyn TimeSource>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::with_time_source(SystemTimeSource)
    }

    pub fn with_time_source<T: TimeSource + 'static>(time_source: T) -> Self {
        Self {
            entries: DashMap::new(),
            time_source: Box::new(time_source),
        }
    }

    /// Get-or-create a device seen through discovery.
    ///
    /// Repeated discovery of the same id refreshes `last_seen_at` and the
    /// display name but never creates a second entry or moves the state.
    pub fn device_found(&self, id: DeviceId, display_name: Option<String>) -> Observation {
        self.observe(id, display_name, DeviceState::Discovered)
    }

    /// Get-or-create a device whose first observation is a connection request
    pub fn get_or_add(
        &self,
        id: DeviceId,
        display_name: Option<String>,
        initial_state: DeviceState,
    ) -> Observation {
        self.observe(id, display_name, initial_state)
    }

    fn observe(
        &self,
        id: DeviceId,
        display_name: Option<String>,
        initial_state: DeviceState,
    ) -> Observation {
        let now = self.time_source.now();
        match self.entries.entry(id) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let is_new = !entry.visible;
                entry.visible = true;
                entry.device.last_seen_at = now;
                if display_name.is_some() {
                    entry.device.display_name = display_name;
                }
                Observation {
                    device: entry.device.clone(),
                    is_new,
                }
            }
            Entry::Vacant(vacant) => {
                let mut device = Device::new(vacant.key().clone(), display_name, initial_state);
                device.last_seen_at = now;
                trace!("Registry added {}", device);
                vacant.insert(RegistryEntry {
                    device: device.clone(),
                    visible: true,
                });
                Observation {
                    device,
                    is_new: true,
                }
            }
        }
    }

    /// Remove a device discovery can no longer see
    pub fn device_lost(&self, id: &DeviceId) -> Option<Device> {
        self.entries.remove(id).map(|(_, entry)| entry.device)
    }

    /// Remember that discovery lost sight of a device without removing it.
    ///
    /// Used for devices that are mid-connection: they stay tracked, and a
    /// later reject reverts them to removal instead of `Discovered`.
    pub fn mark_not_visible(&self, id: &DeviceId) -> Option<Device> {
        self.entries.get_mut(id).map(|mut entry| {
            entry.visible = false;
            entry.device.clone()
        })
    }

    pub fn is_visible(&self, id: &DeviceId) -> bool {
        self.entries.get(id).map(|e| e.visible).unwrap_or(false)
    }

    /// Move a device to `new_state` unconditionally
    pub fn set_state(&self, id: &DeviceId, new_state: DeviceState) -> Option<StateChange> {
        let mut entry = self.entries.get_mut(id)?;
        let previous = entry.device.state;
        entry.device.state = new_state;
        Some(StateChange {
            device: entry.device.clone(),
            previous,
        })
    }

    /// Move a device to `new_state` only if its current state passes `guard`.
    ///
    /// The check and the write happen under the same shard lock, so two
    /// racing callers cannot both observe the old state.
    pub fn transition_if<F>(&self, id: &DeviceId, guard: F, new_state: DeviceState) -> TransitionOutcome
    where
        F: FnOnce(DeviceState) -> bool,
    {
        match self.entries.get_mut(id) {
            None => TransitionOutcome::Missing,
            Some(mut entry) => {
                let previous = entry.device.state;
                if !guard(previous) {
                    return TransitionOutcome::Rejected(entry.device.clone());
                }
                entry.device.state = new_state;
                TransitionOutcome::Applied(StateChange {
                    device: entry.device.clone(),
                    previous,
                })
            }
        }
    }

    /// Remove a device after it disconnected
    pub fn device_disconnected(&self, id: &DeviceId) -> Option<Device> {
        self.entries.remove(id).map(|(_, entry)| entry.device)
    }

    /// Remove a device only if its current state passes `guard`
    pub fn remove_if<F>(&self, id: &DeviceId, guard: F) -> Option<Device>
    where
        F: Fn(DeviceState) -> bool,
    {
        self.entries
            .remove_if(id, |_, entry| guard(entry.device.state))
            .map(|(_, entry)| entry.device)
    }

    pub fn get(&self, id: &DeviceId) -> Option<Device> {
        self.entries.get(id).map(|e| e.device.clone())
    }

    pub fn state(&self, id: &DeviceId) -> Option<DeviceState> {
        self.entries.get(id).map(|e| e.device.state)
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every device, returning how many were tracked
    pub fn clear(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Point-in-time copy of all devices, ordered by id
    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.entries.iter().map(|e| e.device.clone()).collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Snapshot of devices currently in `state`
    pub fn devices_in(&self, state: DeviceState) -> Vec<Device> {
        self.devices()
            .into_iter()
            .filter(|d| d.state == state)
            .collect()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.entries.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
