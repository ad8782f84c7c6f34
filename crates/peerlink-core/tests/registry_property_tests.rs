//! Property-based tests for registry identity and transfer resolution
//!
//! These tests drive the registry and the transfer tracker with arbitrary
//! operation sequences and check the invariants that must hold afterwards.

use peerlink_core::{
    DeviceId, DeviceRegistry, DeviceState, OutgoingTransfer, PayloadId, TransferError,
    TransferProgress, TransferStatus,
};
use proptest::prelude::*;
use std::collections::HashSet;

/// Small id space so sequences revisit the same devices
fn arb_device_id() -> impl Strategy<Value = DeviceId> {
    prop::sample::select(vec!["A", "B", "C", "D", "E"]).prop_map(DeviceId::from)
}

fn arb_name() -> impl Strategy<Value = Option<String>> {
    prop::option::of(prop::sample::select(vec!["Alice", "Bob", "Carol"]).prop_map(String::from))
}

fn arb_state() -> impl Strategy<Value = DeviceState> {
    prop::sample::select(vec![
        DeviceState::Discovered,
        DeviceState::ConnectionRequestedOutbound,
        DeviceState::ConnectionRequestedInbound,
        DeviceState::Connected,
    ])
}

#[derive(Debug, Clone)]
enum RegistryOp {
    Found(DeviceId, Option<String>),
    GetOrAdd(DeviceId, Option<String>, DeviceState),
    Lost(DeviceId),
    MarkNotVisible(DeviceId),
    SetState(DeviceId, DeviceState),
    Disconnected(DeviceId),
}

fn arb_op() -> impl Strategy<Value = RegistryOp> {
    prop_oneof![
        (arb_device_id(), arb_name()).prop_map(|(id, name)| RegistryOp::Found(id, name)),
        (arb_device_id(), arb_name(), arb_state())
            .prop_map(|(id, name, state)| RegistryOp::GetOrAdd(id, name, state)),
        arb_device_id().prop_map(RegistryOp::Lost),
        arb_device_id().prop_map(RegistryOp::MarkNotVisible),
        (arb_device_id(), arb_state()).prop_map(|(id, state)| RegistryOp::SetState(id, state)),
        arb_device_id().prop_map(RegistryOp::Disconnected),
    ]
}

fn apply(registry: &DeviceRegistry, op: &RegistryOp) {
    match op {
        RegistryOp::Found(id, name) => {
            registry.device_found(id.clone(), name.clone());
        }
        RegistryOp::GetOrAdd(id, name, state) => {
            registry.get_or_add(id.clone(), name.clone(), *state);
        }
        RegistryOp::Lost(id) => {
            registry.device_lost(id);
        }
        RegistryOp::MarkNotVisible(id) => {
            registry.mark_not_visible(id);
        }
        RegistryOp::SetState(id, state) => {
            registry.set_state(id, *state);
        }
        RegistryOp::Disconnected(id) => {
            registry.device_disconnected(id);
        }
    }
}

fn arb_status() -> impl Strategy<Value = TransferStatus> {
    prop::sample::select(vec![
        TransferStatus::InProgress,
        TransferStatus::Success,
        TransferStatus::Failure,
        TransferStatus::Canceled,
    ])
}

proptest! {
    /// Property: repeated discovery of an id always yields the same device
    #[test]
    fn repeated_discovery_is_idempotent(id in arb_device_id(), name in arb_name(), repeats in 1usize..10) {
        let registry = DeviceRegistry::new();
        let first = registry.device_found(id.clone(), name.clone());
        prop_assert!(first.is_new);

        for _ in 1..repeats {
            let again = registry.device_found(id.clone(), name.clone());
            prop_assert!(!again.is_new);
            prop_assert_eq!(&again.device.id, &id);
            prop_assert_eq!(again.device.state, DeviceState::Discovered);
        }
        prop_assert_eq!(registry.len(), 1);
    }

    /// Property: no operation sequence leaves two entries for one id
    #[test]
    fn registry_never_duplicates_ids(ops in prop::collection::vec(arb_op(), 0..64)) {
        let registry = DeviceRegistry::new();
        for op in &ops {
            apply(&registry, op);
        }

        let snapshot = registry.devices();
        let unique: HashSet<_> = snapshot.iter().map(|d| d.id.clone()).collect();
        prop_assert_eq!(unique.len(), snapshot.len());
        prop_assert_eq!(snapshot.len(), registry.len());
        prop_assert!(snapshot.windows(2).all(|pair| pair[0].id < pair[1].id));
    }

    /// Property: a state change is reported only when the state moved
    #[test]
    fn set_state_reports_change_only_when_state_differs(
        id in arb_device_id(),
        initial in arb_state(),
        next in arb_state(),
    ) {
        let registry = DeviceRegistry::new();
        registry.get_or_add(id.clone(), None, initial);

        let change = registry.set_state(&id, next).expect("device is tracked");
        prop_assert_eq!(change.previous, initial);
        prop_assert_eq!(change.device.state, next);
        prop_assert_eq!(change.is_change(), initial != next);
        prop_assert_eq!(registry.state(&id), Some(next));
    }

    /// Property: unknown ids are no-ops, never errors
    #[test]
    fn unknown_ids_yield_none(id in arb_device_id(), state in arb_state()) {
        let registry = DeviceRegistry::new();
        prop_assert!(registry.device_lost(&id).is_none());
        prop_assert!(registry.set_state(&id, state).is_none());
        prop_assert!(registry.device_disconnected(&id).is_none());
        prop_assert!(registry.is_empty());
    }

    /// Property: the first terminal update decides the outcome
    #[test]
    fn first_terminal_status_wins(statuses in prop::collection::vec(arb_status(), 1..16)) {
        let payload_id = PayloadId::new(1);
        let (transfer, mut completion) = OutgoingTransfer::new(payload_id, None, None);

        for (i, status) in statuses.iter().enumerate() {
            transfer.on_update(TransferProgress::new(payload_id, i as u64, 16, *status));
        }

        let outcome = completion.try_outcome();
        match statuses.iter().find(|s| s.is_terminal()) {
            None => prop_assert!(outcome.is_none()),
            Some(TransferStatus::Success) => prop_assert!(matches!(outcome, Some(Ok(_)))),
            Some(TransferStatus::Failure) => {
                prop_assert!(matches!(outcome, Some(Err(TransferError::Failed { .. }))), "expected Failed outcome, got {:?}", outcome)
            }
            Some(_) => prop_assert!(matches!(outcome, Some(Err(TransferError::Canceled { .. }))), "expected Canceled outcome, got {:?}", outcome),
        }
    }
}
