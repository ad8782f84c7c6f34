//! Outgoing transfer tests
//!
//! Sends to connected devices, progress routing back into the tracker,
//! inactivity signalling and failure paths.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use peerlink_core::{
    DeviceId, DeviceState, EventKind, PeerlinkError, TransferError, TransferProgress,
    TransferStatus, TransportError,
};
use peerlink_harness::{MockOperation, MockTransport, TestHarness};
use peerlink_runtime::{PeerlinkConfig, SendOptions};

fn id(raw: &str) -> DeviceId {
    DeviceId::from(raw)
}

async fn connect(harness: &mut TestHarness, raw: &str) {
    harness.transport.discover(raw, "peer");
    harness.session.request_connection(&id(raw)).await.unwrap();
    harness.transport.accept_from_remote(raw);
    assert_eq!(
        harness.session.device(&id(raw)).map(|device| device.state),
        Some(DeviceState::Connected)
    );
    harness.drain_events();
}

async fn connected_harness() -> TestHarness {
    let mut harness = TestHarness::new().unwrap();
    connect(&mut harness, "A").await;
    harness
}

#[tokio::test]
async fn test_progress_reaches_sink_and_completion() {
    let mut harness = connected_harness().await;
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let reported = reported.clone();
        move |progress: &TransferProgress| reported.lock().unwrap().push(progress.status)
    };

    let handle = harness
        .session
        .send(&id("A"), vec![7; 100], SendOptions::new().with_progress(sink))
        .await
        .unwrap();
    let payload_id = harness.transport.last_payload_for(&id("A")).unwrap();
    assert_eq!(handle.payload_id(), payload_id);
    assert_eq!(harness.session.in_flight_transfers(), 1);

    harness
        .transport
        .progress("A", TransferProgress::in_progress(payload_id, 50, 100));
    harness.transport.progress(
        "A",
        TransferProgress::new(payload_id, 100, 100, TransferStatus::Success),
    );

    let outcome = handle.finish().await.unwrap();
    assert_eq!(outcome.bytes_transferred, 100);
    assert_eq!(
        *reported.lock().unwrap(),
        vec![TransferStatus::InProgress, TransferStatus::Success]
    );
    assert_eq!(harness.session.in_flight_transfers(), 0);

    let progress_events = harness
        .drain_events()
        .into_iter()
        .filter(|event| matches!(event.kind, EventKind::TransferProgress { .. }))
        .count();
    assert_eq!(progress_events, 2);
}

#[tokio::test]
async fn test_reported_failure_fails_completion() {
    let mut harness = connected_harness().await;
    let handle = harness
        .session
        .send(&id("A"), vec![1; 10], SendOptions::new())
        .await
        .unwrap();

    harness.transport.progress(
        "A",
        TransferProgress::new(handle.payload_id(), 3, 10, TransferStatus::Failure),
    );

    assert!(matches!(
        handle.finish().await,
        Err(TransferError::Failed { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_inactivity_signals_without_resolving() {
    let mut harness = connected_harness().await;
    let mut handle = harness
        .session
        .send(
            &id("A"),
            vec![0; 1000],
            SendOptions::new().with_inactivity_timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap();
    let payload_id = handle.payload_id();

    harness
        .transport
        .progress("A", TransferProgress::in_progress(payload_id, 100, 1000));
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert!(handle.inactivity_token().is_cancelled());
    assert!(handle.try_outcome().is_none());

    assert!(handle.cancel());
    harness.transport.progress(
        "A",
        TransferProgress::new(payload_id, 1000, 1000, TransferStatus::Success),
    );

    assert!(matches!(
        handle.try_outcome(),
        Some(Err(TransferError::Canceled { .. }))
    ));
    assert_eq!(harness.session.in_flight_transfers(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_finish_or_abandon_gives_up_on_quiet_transport() {
    let harness = connected_harness().await;
    let handle = harness
        .session
        .send(
            &id("A"),
            vec![0; 10],
            SendOptions::new().with_inactivity_timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap();

    assert!(matches!(
        handle.finish_or_abandon().await,
        Err(TransferError::Abandoned { .. })
    ));
}

#[tokio::test]
async fn test_native_send_failure_resolves_and_unregisters() {
    let harness = connected_harness().await;
    harness
        .transport
        .fail_next(MockOperation::Send, TransportError::failed("send", "link busy"));

    let err = harness
        .session
        .send(&id("A"), vec![1, 2, 3], SendOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PeerlinkError::Transport(_)));
    assert_eq!(harness.session.in_flight_transfers(), 0);
}

#[tokio::test]
async fn test_send_requires_connected_device() {
    let mut harness = TestHarness::new().unwrap();
    harness.transport.discover("A", "Alice");

    let err = harness
        .session
        .send(&id("A"), vec![1], SendOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PeerlinkError::InvalidTransition { .. }));

    let err = harness
        .session
        .send(&id("ghost"), vec![1], SendOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PeerlinkError::DeviceNotFound { .. }));
    assert_eq!(harness.transport.count(MockOperation::Send), 0);
    harness.drain_events();
}

#[tokio::test]
async fn test_oversized_payload_is_refused() {
    let harness = connected_harness().await;
    let limit = harness.session.config().transfer.max_payload_bytes;

    let err = harness
        .session
        .send(&id("A"), vec![0; limit + 1], SendOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PeerlinkError::PayloadTooLarge { .. }));
    assert_eq!(harness.transport.count(MockOperation::Send), 0);
}

#[tokio::test]
async fn test_disconnect_fails_inflight_transfers() {
    let harness = connected_harness().await;
    let handle = harness
        .session
        .send(&id("A"), vec![1; 10], SendOptions::new())
        .await
        .unwrap();

    harness.transport.disconnect_from_remote("A");

    assert!(matches!(
        handle.finish().await,
        Err(TransferError::Failed { .. })
    ));
    assert_eq!(harness.session.in_flight_transfers(), 0);
}

#[tokio::test]
async fn test_progress_for_untracked_device_is_not_published() {
    let mut harness = connected_harness().await;
    let handle = harness
        .session
        .send(&id("A"), vec![1; 10], SendOptions::new())
        .await
        .unwrap();

    harness
        .transport
        .progress("stranger", TransferProgress::in_progress(handle.payload_id(), 1, 10));
    harness.transport.deliver("stranger", b"hi".to_vec());

    assert!(harness.drain_events().is_empty());
}

#[tokio::test]
async fn test_received_data_is_published_for_connected_device() {
    let mut harness = connected_harness().await;

    harness.transport.deliver("A", b"hello".to_vec());

    let events = harness.drain_events();
    assert_eq!(events.len(), 1);
    match &events[0].kind {
        EventKind::DataReceived { device, data, .. } => {
            assert_eq!(device.id, id("A"));
            assert_eq!(data, b"hello");
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_session_transport_reports_completion_once() {
    let mut harness =
        TestHarness::with_transport(MockTransport::session(), PeerlinkConfig::testing()).unwrap();
    connect(&mut harness, "A").await;

    let handle = harness
        .session
        .send(&id("A"), vec![9; 32], SendOptions::new())
        .await
        .unwrap();
    harness.transport.progress(
        "A",
        TransferProgress::new(handle.payload_id(), 32, 32, TransferStatus::Success),
    );

    let outcome = handle.finish().await.unwrap();
    assert_eq!(outcome.status, TransferStatus::Success);
    assert_eq!(outcome.bytes_transferred, 32);
}

#[tokio::test]
async fn test_ideal_transport_completes_sends_on_its_own() {
    let mut harness =
        TestHarness::with_transport(MockTransport::ideal(), PeerlinkConfig::testing()).unwrap();
    harness.transport.discover("A", "Alice");
    harness.session.request_connection(&id("A")).await.unwrap();
    harness
        .wait_for(|kind| matches!(kind, EventKind::ConnectionResponded { accepted: true, .. }))
        .await
        .unwrap();

    let handle = harness
        .session
        .send(&id("A"), vec![5; 3000], SendOptions::new())
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(1), handle.finish())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.bytes_transferred, 3000);
}
