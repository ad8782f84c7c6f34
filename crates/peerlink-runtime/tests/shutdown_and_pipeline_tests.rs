//! Teardown and pipeline isolation tests
//!
//! Shutdown ordering, callbacks outliving the session, and failures in
//! processors or handlers staying contained.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use peerlink_core::{
    BufferPolicy, DeviceFilter, DeviceId, DomainEvent, EventHandler, EventKind, EventProcessor,
    FnProcessor, PeerlinkConfig, PeerlinkError, ProcessorError, TransferError,
};
use peerlink_harness::{event_names, MockOperation, MockTransport, TestHarness};
use peerlink_runtime::SendOptions;

fn id(raw: &str) -> DeviceId {
    DeviceId::from(raw)
}

// ----------------------------------------------------------------------------
// Shutdown
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_shutdown_tears_everything_down() {
    let mut harness = TestHarness::new().unwrap();
    harness.session.start_advertising().await.unwrap();
    harness.session.start_discovery().await.unwrap();
    harness.transport.discover("A", "Alice");
    harness.transport.discover("B", "Bob");
    harness.session.request_connection(&id("A")).await.unwrap();
    harness.transport.accept_from_remote("A");
    let handle = harness
        .session
        .send(&id("A"), vec![1; 16], SendOptions::new())
        .await
        .unwrap();
    harness.drain_events();

    harness.session.shutdown().await;

    assert!(harness.session.is_shut_down());
    assert!(!harness.session.is_advertising());
    assert!(!harness.session.is_discovering());
    assert!(harness.session.devices().is_empty());
    assert_eq!(harness.session.in_flight_transfers(), 0);
    assert_eq!(harness.transport.count(MockOperation::StopAdvertising), 1);
    assert_eq!(harness.transport.count(MockOperation::StopDiscovery), 1);
    assert_eq!(harness.transport.count(MockOperation::Disconnect), 1);
    assert!(matches!(
        handle.finish().await,
        Err(TransferError::Failed { .. } | TransferError::Canceled { .. })
    ));

    let names = event_names(&harness.drain_events());
    assert!(names.contains(&"AdvertisingStateChanged"));
    assert!(names.contains(&"DiscoveringStateChanged"));
    assert!(names.contains(&"DeviceDisconnected"));
    assert!(harness.next_event_timeout(Duration::from_millis(50)).await.is_none());
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let harness = TestHarness::new().unwrap();
    harness.session.start_advertising().await.unwrap();

    harness.session.shutdown().await;
    let commands = harness.transport.commands().len();
    harness.session.shutdown().await;

    assert_eq!(harness.transport.commands().len(), commands);
}

#[tokio::test]
async fn test_native_callbacks_after_shutdown_are_noops() {
    let mut harness = TestHarness::new().unwrap();
    let callbacks = harness.session.callbacks();
    harness.session.shutdown().await;

    assert!(harness.transport.discover("late", "Late"));
    callbacks.cluster(peerlink_core::ClusterNotification::Disconnected {
        endpoint_id: "late".into(),
    });

    assert!(harness.session.devices().is_empty());
    assert!(harness.drain_events().is_empty());
}

#[tokio::test]
async fn test_callbacks_do_not_keep_session_alive() {
    let harness = TestHarness::new().unwrap();
    let callbacks = harness.session.callbacks();
    assert!(callbacks.is_attached());

    let TestHarness { session, .. } = harness;
    drop(session);

    assert!(!callbacks.is_attached());
    callbacks.cluster(peerlink_core::ClusterNotification::EndpointLost {
        endpoint_id: "A".into(),
    });
}

#[tokio::test]
async fn test_commands_after_shutdown_are_canceled() {
    let mut harness = TestHarness::new().unwrap();
    harness.transport.discover("A", "Alice");
    harness.session.shutdown().await;
    harness.drain_events();

    let err = harness.session.start_advertising().await.unwrap_err();
    assert!(matches!(err, PeerlinkError::Canceled { .. }));
    assert_eq!(harness.transport.count(MockOperation::StartAdvertising), 0);
}

// ----------------------------------------------------------------------------
// Pipeline Isolation
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_failing_processor_does_not_block_other_sources() {
    let processor = FnProcessor::new("flaky", |event: DomainEvent| {
        let device = event.kind.device().map(|device| device.id.to_string());
        match device.as_deref() {
            Some("bad") => Err(ProcessorError::new("flaky", "refuses bad")),
            Some("worse") => panic!("processor blew up"),
            _ => Ok(Some(event)),
        }
    });
    let mut harness = TestHarness::with_builder(MockTransport::cluster(), |builder| {
        builder
            .with_config(PeerlinkConfig::testing())
            .with_processor(processor)
    })
    .unwrap();
    let mut other = harness.session.subscribe();

    harness.transport.discover("bad", "");
    harness.transport.discover("worse", "");
    harness.transport.discover("good", "Good");

    let seen = harness.drain_events();
    assert_eq!(event_names(&seen), vec!["DeviceFound"]);
    assert_eq!(other.drain().len(), 1);
    assert_eq!(harness.session.stats().processor_failures, 2);
    // The registry still tracks what the processor refused to publish.
    assert_eq!(harness.session.devices().len(), 3);
}

struct PanickingHandler {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl EventHandler for PanickingHandler {
    async fn handle(&self, event: DomainEvent) -> peerlink_core::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if matches!(event.kind, EventKind::DeviceFound { .. }) {
            panic!("handler cannot cope");
        }
        Err(PeerlinkError::config_error("handler rejects everything"))
    }
}

#[tokio::test]
async fn test_failing_handler_is_isolated() {
    let mut harness = TestHarness::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let task = harness.session.spawn_handler(PanickingHandler {
        calls: calls.clone(),
    });

    harness.transport.discover("A", "Alice");
    harness.transport.lose("A");
    harness.transport.discover("B", "Bob");

    for _ in 0..100 {
        if calls.load(Ordering::SeqCst) == 3 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(harness.session.stats().handler_failures, 3);
    assert_eq!(harness.drain_events().len(), 3);

    harness.session.shutdown().await;
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_blocked_devices_are_filtered() {
    let mut config = PeerlinkConfig::testing();
    config.session.blocked_devices = vec!["self".to_string()];
    let filter = Arc::new(DeviceFilter::new());
    let shared: Arc<dyn EventProcessor> = filter.clone();
    let mut harness = TestHarness::with_builder(MockTransport::cluster(), |builder| {
        builder.with_config(config).with_shared_processor(shared)
    })
    .unwrap();

    harness.transport.discover("self", "Me");
    harness.transport.discover("A", "Alice");
    filter.block("B");
    harness.transport.discover("B", "Bob");
    assert!(filter.unblock(&id("B")));
    harness.transport.lose("B");

    let events = harness.drain_events();
    let devices: Vec<_> = events
        .iter()
        .filter_map(|event| event.kind.device().map(|device| device.id.to_string()))
        .collect();
    assert_eq!(devices, vec!["A".to_string(), "B".to_string()]);
    assert!(matches!(events[1].kind, EventKind::DeviceLost { .. }));
    // Configured ids are never tracked; runtime filtering only hides events.
    assert!(harness.session.device(&id("self")).is_none());
    harness.transport.invite("self", "Me");
    assert!(harness.session.device(&id("self")).is_none());
    assert!(harness.drain_events().is_empty());
}

#[tokio::test]
async fn test_duplicate_notifications_are_suppressed() {
    let mut config = PeerlinkConfig::testing();
    config.pipeline.duplicate_window_ms = 1_000;
    let mut harness = TestHarness::with_transport(MockTransport::cluster(), config).unwrap();
    harness.transport.discover("A", "Alice");
    harness.session.request_connection(&id("A")).await.unwrap();
    harness.transport.accept_from_remote("A");
    harness.drain_events();

    harness.transport.deliver("A", b"same".to_vec());
    let handle = harness
        .session
        .send(&id("A"), vec![0; 10], SendOptions::new())
        .await
        .unwrap();
    let progress = peerlink_core::TransferProgress::in_progress(handle.payload_id(), 5, 10);
    harness.transport.progress("A", progress.clone());
    harness.transport.progress("A", progress);

    let names = event_names(&harness.drain_events());
    assert_eq!(names, vec!["DataReceived", "TransferProgress"]);
}

#[tokio::test]
async fn test_bounded_buffer_drops_oldest_for_slow_subscriber() {
    let mut config = PeerlinkConfig::testing();
    config.pipeline.buffer = BufferPolicy::DropOldest { capacity: 4 };
    let mut harness = TestHarness::with_transport(MockTransport::cluster(), config).unwrap();

    for n in 0..10 {
        harness.transport.discover(&format!("peer-{}", n), "");
    }

    let mut received = Vec::new();
    while let Some(event) = harness.next_event_timeout(Duration::from_millis(20)).await {
        received.push(event);
    }
    assert_eq!(received.len(), 4);
    assert_eq!(
        received.last().and_then(|event| event.kind.device()).map(|d| d.id.to_string()),
        Some("peer-9".to_string())
    );
    assert!(harness.session.stats().lagged >= 6);
    assert_eq!(harness.session.devices().len(), 10);
}
