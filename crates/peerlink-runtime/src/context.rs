//! Session context: registry reconciliation and event dispatch
//!
//! Every native notification passes through here. The adapter's event is
//! treated as intent: the registry is mutated first, then the event is
//! re-stamped with the registry's device and emitted, so a subscriber never
//! sees an event the registry does not already reflect.
//!
//! Devices listed in `session.blocked_devices` are dropped here, before the
//! registry is touched, so they never appear in snapshots or hold a state.
//! A `DeviceFilter` in the processor chain only hides events.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use peerlink_core::{
    ClusterAdapter, ClusterNotification, Device, DeviceId, DeviceRegistry, DeviceState,
    DomainEvent, EventAdapter, EventKind, EventPipeline, OutgoingTransfer, PayloadId, SessionAdapter,
    SessionNotification, TransferConfig, TransferProgress, TransitionOutcome,
};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::invitation::Invitation;

struct TrackedTransfer {
    device_id: DeviceId,
    transfer: Arc<OutgoingTransfer>,
}

/// Shared state of one peer session
pub struct SessionContext {
    registry: DeviceRegistry,
    pipeline: EventPipeline,
    ignored: HashSet<DeviceId>,
    transfers: DashMap<PayloadId, TrackedTransfer>,
    cluster_adapter: ClusterAdapter,
    session_adapter: SessionAdapter,
    invitations: mpsc::UnboundedSender<Invitation>,
    transfer_config: TransferConfig,
}

impl SessionContext {
    pub(crate) fn new(
        registry: DeviceRegistry,
        pipeline: EventPipeline,
        service_id: &str,
        transfer_config: TransferConfig,
        invitations: mpsc::UnboundedSender<Invitation>,
    ) -> Self {
        Self {
            registry,
            pipeline,
            ignored: HashSet::new(),
            transfers: DashMap::new(),
            cluster_adapter: ClusterAdapter::for_service(service_id),
            session_adapter: SessionAdapter::new(),
            invitations,
            transfer_config,
        }
    }

    /// Drop every notification about `ids` before it reaches the registry
    pub(crate) fn with_ignored<I, D>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DeviceId>,
    {
        self.ignored.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn transfer_config(&self) -> &TransferConfig {
        &self.transfer_config
    }

    pub fn pipeline(&self) -> &EventPipeline {
        &self.pipeline
    }

    // ------------------------------------------------------------------------
    // Native Notifications
    // ------------------------------------------------------------------------

    pub(crate) fn handle_cluster(&self, notification: &ClusterNotification) {
        match self.cluster_adapter.transform(notification) {
            Some(intent) => self.dispatch(intent),
            None => trace!("Cluster notification produced no event"),
        }
    }

    pub(crate) fn handle_session(&self, notification: &SessionNotification) {
        match self.session_adapter.transform(notification) {
            Some(intent) => self.dispatch(intent),
            None => trace!("Session notification produced no event"),
        }
    }

    /// Reconcile `intent` against the registry and emit the result
    pub(crate) fn dispatch(&self, intent: DomainEvent) {
        if self.pipeline.is_closed() {
            trace!("Session closed; ignoring {}", intent.name());
            return;
        }
        if let Some(device) = intent.device().filter(|device| self.ignored.contains(&device.id)) {
            trace!("Ignoring {} for blocked device {}", intent.name(), device.id);
            return;
        }
        let events = self.reconcile(intent);
        self.emit_all(events);
    }

    pub(crate) fn emit(&self, event: DomainEvent) -> bool {
        let invitation = match &event.kind {
            EventKind::ConnectionRequested {
                device,
                context,
                authentication_token,
            } => Some(Invitation {
                device: device.clone(),
                context: context.clone(),
                authentication_token: authentication_token.clone(),
            }),
            _ => None,
        };

        let emitted = self.pipeline.emit(event);
        if emitted {
            if let Some(invitation) = invitation {
                // No receiver once the session is shutting down.
                let _ = self.invitations.send(invitation);
            }
        }
        emitted
    }

    pub(crate) fn emit_all(&self, events: Vec<DomainEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    // ------------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------------

    fn reconcile(&self, intent: DomainEvent) -> Vec<DomainEvent> {
        let DomainEvent {
            id: event_id,
            timestamp,
            kind,
        } = intent;
        let stamp = move |kind: EventKind| DomainEvent {
            id: event_id,
            timestamp,
            kind,
        };

        match kind {
            EventKind::DeviceFound { device } => {
                let observation = self.registry.device_found(device.id, device.display_name);
                if observation.is_new {
                    vec![stamp(EventKind::DeviceFound {
                        device: observation.device,
                    })]
                } else {
                    trace!("Refreshed {}", observation.device.id);
                    Vec::new()
                }
            }
            EventKind::DeviceLost { device } => {
                match self
                    .registry
                    .remove_if(&device.id, |state| state == DeviceState::Discovered)
                {
                    Some(removed) => vec![stamp(EventKind::DeviceLost { device: removed })],
                    None => {
                        if self.registry.mark_not_visible(&device.id).is_some() {
                            debug!("Lost sight of {} mid-connection; keeping it tracked", device.id);
                        }
                        Vec::new()
                    }
                }
            }
            EventKind::ConnectionRequested {
                device,
                context,
                authentication_token,
            } => self
                .on_connection_requested(device)
                .map(|(changed, device)| {
                    let mut events: Vec<DomainEvent> = changed.into_iter().collect();
                    events.push(stamp(EventKind::ConnectionRequested {
                        device,
                        context,
                        authentication_token,
                    }));
                    events
                })
                .unwrap_or_default(),
            EventKind::ConnectionResponded { device, accepted } => {
                self.on_connection_responded(&device.id, accepted)
            }
            EventKind::DeviceDisconnected { device } => self.on_disconnected(&device.id),
            EventKind::TransferProgress { device, progress } => {
                self.route_progress(&device.id, &progress);
                self.with_tracked(device, |device| {
                    stamp(EventKind::TransferProgress { device, progress })
                })
            }
            EventKind::DataReceived {
                device,
                payload_id,
                data,
            } => self.with_tracked(device, |device| {
                stamp(EventKind::DataReceived {
                    device,
                    payload_id,
                    data,
                })
            }),
            EventKind::DeviceStateChanged { device, previous } => {
                self.with_tracked(device, |device| {
                    stamp(EventKind::DeviceStateChanged { device, previous })
                })
            }
            kind @ (EventKind::AdvertisingStateChanged { .. }
            | EventKind::DiscoveringStateChanged { .. }) => vec![stamp(kind)],
        }
    }

    /// Returns the state change, if any, and the inbound device to announce
    fn on_connection_requested(&self, device: Device) -> Option<(Option<DomainEvent>, Device)> {
        let id = device.id.clone();
        if !self.registry.contains(&id) {
            let observation = self.registry.get_or_add(
                id.clone(),
                device.display_name,
                DeviceState::ConnectionRequestedInbound,
            );
            if observation.device.state == DeviceState::ConnectionRequestedInbound {
                return Some((None, observation.device));
            }
        }

        match self.registry.transition_if(
            &id,
            |state| state == DeviceState::Discovered,
            DeviceState::ConnectionRequestedInbound,
        ) {
            TransitionOutcome::Applied(change) => {
                let changed = DomainEvent::state_changed(change.device.clone(), change.previous);
                Some((Some(changed), change.device))
            }
            TransitionOutcome::Rejected(existing) => {
                debug!(
                    "Ignoring duplicate connection request from {} in state {}",
                    existing.id, existing.state
                );
                None
            }
            TransitionOutcome::Missing => None,
        }
    }

    fn on_connection_responded(&self, id: &DeviceId, accepted: bool) -> Vec<DomainEvent> {
        match self.registry.state(id) {
            Some(state) if state.is_requested() => {
                if accepted {
                    self.complete_connection(id)
                } else {
                    self.resolve_rejection(id)
                }
            }
            Some(DeviceState::Connected) if accepted => {
                debug!("{} already connected; duplicate acceptance ignored", id);
                Vec::new()
            }
            Some(DeviceState::Connected) => self.on_disconnected(id),
            Some(state) => {
                debug!("Connection response for {} in state {} ignored", id, state);
                Vec::new()
            }
            None => {
                debug!("Connection response for untracked {} ignored", id);
                Vec::new()
            }
        }
    }

    /// Move a requested device to `Connected`
    pub(crate) fn complete_connection(&self, id: &DeviceId) -> Vec<DomainEvent> {
        match self
            .registry
            .transition_if(id, |state| state.is_requested(), DeviceState::Connected)
        {
            TransitionOutcome::Applied(change) => vec![
                DomainEvent::state_changed(change.device.clone(), change.previous),
                DomainEvent::connection_responded(change.device, true),
            ],
            _ => Vec::new(),
        }
    }

    /// Undo a pending request: back to `Discovered`, or removed if discovery
    /// has since lost sight of the device
    pub(crate) fn resolve_rejection(&self, id: &DeviceId) -> Vec<DomainEvent> {
        if self.registry.is_visible(id) {
            match self
                .registry
                .transition_if(id, |state| state.is_requested(), DeviceState::Discovered)
            {
                TransitionOutcome::Applied(change) => vec![
                    DomainEvent::state_changed(change.device.clone(), change.previous),
                    DomainEvent::connection_responded(change.device, false),
                ],
                _ => Vec::new(),
            }
        } else {
            match self.registry.remove_if(id, |state| state.is_requested()) {
                Some(device) => vec![
                    DomainEvent::connection_responded(device.clone(), false),
                    DomainEvent::device_lost(device),
                ],
                None => Vec::new(),
            }
        }
    }

    /// Remove a connected device; a pending request is treated as rejected
    pub(crate) fn on_disconnected(&self, id: &DeviceId) -> Vec<DomainEvent> {
        match self.registry.state(id) {
            Some(DeviceState::Connected) => {
                match self
                    .registry
                    .remove_if(id, |state| state == DeviceState::Connected)
                {
                    Some(device) => {
                        self.fail_transfers_for(id, "device disconnected");
                        vec![DomainEvent::device_disconnected(device)]
                    }
                    None => Vec::new(),
                }
            }
            Some(state) if state.is_requested() => self.resolve_rejection(id),
            _ => {
                trace!("Disconnect for {} needs no change", id);
                Vec::new()
            }
        }
    }

    fn with_tracked<F>(&self, device: Device, build: F) -> Vec<DomainEvent>
    where
        F: FnOnce(Device) -> DomainEvent,
    {
        match self.registry.get(&device.id) {
            Some(tracked) => vec![build(tracked)],
            None => {
                debug!("Dropping event for untracked device {}", device.id);
                Vec::new()
            }
        }
    }

    // ------------------------------------------------------------------------
    // In-flight Transfers
    // ------------------------------------------------------------------------

    /// Allocate a payload id not used by any in-flight transfer
    pub(crate) fn allocate_payload_id(&self) -> PayloadId {
        loop {
            let candidate = PayloadId::generate();
            if !self.transfers.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub(crate) fn register_transfer(&self, device_id: DeviceId, transfer: Arc<OutgoingTransfer>) {
        self.prune_resolved();
        self.transfers.insert(
            transfer.payload_id(),
            TrackedTransfer {
                device_id,
                transfer,
            },
        );
    }

    pub(crate) fn unregister_transfer(&self, payload_id: &PayloadId) {
        self.transfers.remove(payload_id);
    }

    fn route_progress(&self, device_id: &DeviceId, progress: &TransferProgress) {
        let Some(transfer) = self
            .transfers
            .get(&progress.payload_id)
            .filter(|tracked| &tracked.device_id == device_id)
            .map(|tracked| tracked.transfer.clone())
        else {
            return;
        };
        transfer.on_update(progress.clone());
        if transfer.is_resolved() {
            self.unregister_transfer(&progress.payload_id);
        }
    }

    fn fail_transfers_for(&self, device_id: &DeviceId, reason: &str) {
        self.transfers.retain(|_, tracked| {
            if &tracked.device_id == device_id {
                tracked.transfer.fail(reason);
                false
            } else {
                true
            }
        });
    }

    /// Cancel every in-flight transfer, returning how many were pending
    pub(crate) fn cancel_transfers(&self) -> usize {
        let mut canceled = 0;
        self.transfers.retain(|_, tracked| {
            if tracked.transfer.cancel() {
                canceled += 1;
            }
            false
        });
        canceled
    }

    /// Drop entries resolved outside progress routing, e.g. canceled through
    /// their handle or timed out
    fn prune_resolved(&self) {
        self.transfers
            .retain(|_, tracked| !tracked.transfer.is_resolved());
    }

    /// Transfers still awaiting a terminal outcome
    pub fn in_flight_transfers(&self) -> usize {
        self.prune_resolved();
        self.transfers.len()
    }
}

impl core::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionContext")
            .field("registry", &self.registry)
            .field("pipeline", &self.pipeline)
            .field("transfers", &self.transfers.len())
            .finish()
    }
}
