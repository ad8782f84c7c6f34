//! Advertising and discovery session manager tests
//!
//! Single-active-session and idempotent-stop semantics, native failures,
//! start timeouts and cancellation, driven through the mock transport.

use std::time::Duration;

use peerlink_core::{EventKind, PeerlinkError, SessionKind, TransportError};
use peerlink_harness::{event_names, MockOperation, TestHarness};
use peerlink_runtime::DiscoverRequest;
use tokio_util::sync::CancellationToken;

fn advertising_events(events: &[peerlink_core::DomainEvent]) -> Vec<bool> {
    events
        .iter()
        .filter_map(|event| match event.kind {
            EventKind::AdvertisingStateChanged { is_advertising } => Some(is_advertising),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_second_start_fails_and_first_stays_active() {
    let mut harness = TestHarness::new().unwrap();

    harness.session.start_advertising().await.unwrap();
    let err = harness.session.start_advertising().await.unwrap_err();

    assert!(matches!(
        err,
        PeerlinkError::AlreadyActive {
            session: SessionKind::Advertising
        }
    ));
    assert!(err.is_usage_error());
    assert!(harness.session.is_advertising());
    assert_eq!(harness.transport.count(MockOperation::StartAdvertising), 1);
    assert_eq!(advertising_events(&harness.drain_events()), vec![true]);
}

#[tokio::test]
async fn test_concurrent_starts_admit_exactly_one() {
    let mut harness = TestHarness::new().unwrap();

    let (first, second) = tokio::join!(
        harness.session.start_advertising(),
        harness.session.start_advertising()
    );

    assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);
    assert!(harness.session.is_advertising());
    assert_eq!(advertising_events(&harness.drain_events()), vec![true]);
}

#[tokio::test]
async fn test_stop_when_inactive_is_silent_noop() {
    let mut harness = TestHarness::new().unwrap();

    for _ in 0..3 {
        harness.session.stop_advertising().await.unwrap();
        harness.session.stop_discovery().await.unwrap();
    }

    assert!(harness.drain_events().is_empty());
    assert!(harness.transport.commands().is_empty());
}

#[tokio::test]
async fn test_stop_then_restart() {
    let mut harness = TestHarness::new().unwrap();

    harness.session.start_advertising().await.unwrap();
    harness.session.stop_advertising().await.unwrap();
    harness.session.stop_advertising().await.unwrap();
    harness.session.start_advertising().await.unwrap();

    assert!(harness.session.is_advertising());
    assert_eq!(advertising_events(&harness.drain_events()), vec![true, false, true]);
    assert_eq!(harness.transport.count(MockOperation::StopAdvertising), 1);
}

#[tokio::test]
async fn test_native_start_failure_leaves_session_inactive() {
    let mut harness = TestHarness::new().unwrap();
    harness.transport.fail_next(
        MockOperation::StartDiscovery,
        TransportError::Unavailable {
            reason: "radio off".into(),
        },
    );

    let err = harness.session.start_discovery().await.unwrap_err();
    assert!(matches!(
        err,
        PeerlinkError::Transport(TransportError::Unavailable { .. })
    ));
    assert!(!harness.session.is_discovering());
    assert!(harness.drain_events().is_empty());

    // Not retried automatically, but a later start works.
    harness.session.start_discovery().await.unwrap();
    assert!(harness.session.is_discovering());
}

#[tokio::test]
async fn test_native_stop_failure_still_marks_inactive() {
    let mut harness = TestHarness::new().unwrap();
    harness.session.start_advertising().await.unwrap();
    harness
        .transport
        .fail_next(MockOperation::StopAdvertising, TransportError::failed("stop", "busy"));

    harness.session.stop_advertising().await.unwrap();

    assert!(!harness.session.is_advertising());
    assert_eq!(advertising_events(&harness.drain_events()), vec![true, false]);
}

#[tokio::test]
async fn test_advertising_and_discovery_toggle_independently() {
    let mut harness = TestHarness::new().unwrap();

    let (advertise, discover) = tokio::join!(
        harness.session.start_advertising(),
        harness.session.start_discovery()
    );
    advertise.unwrap();
    discover.unwrap();
    assert!(harness.session.is_advertising());
    assert!(harness.session.is_discovering());

    let (advertise, discover) = tokio::join!(
        harness.session.stop_advertising(),
        harness.session.stop_discovery()
    );
    advertise.unwrap();
    discover.unwrap();

    let mut names = event_names(&harness.drain_events());
    names.sort_unstable();
    assert_eq!(
        names,
        vec![
            "AdvertisingStateChanged",
            "AdvertisingStateChanged",
            "DiscoveringStateChanged",
            "DiscoveringStateChanged",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_start_timeout_stops_native_side_best_effort() {
    let mut harness = TestHarness::new().unwrap();
    harness.transport.stall(MockOperation::StartAdvertising);

    let err = harness.session.start_advertising().await.unwrap_err();

    assert!(matches!(
        err,
        PeerlinkError::Transport(TransportError::Timeout { .. })
    ));
    assert!(!harness.session.is_advertising());
    assert_eq!(harness.transport.count(MockOperation::StopAdvertising), 1);
    assert!(harness.drain_events().is_empty());
}

#[tokio::test]
async fn test_canceled_start_never_reports_active() {
    let mut harness = TestHarness::new().unwrap();
    harness.transport.stall(MockOperation::StartDiscovery);
    let token = CancellationToken::new();

    let request = DiscoverRequest {
        service_id: "peerlink-test".into(),
    };
    let start = harness.session.discovery().start(request, &token);
    let cancel = async {
        tokio::task::yield_now().await;
        token.cancel();
    };
    let (result, ()) = tokio::join!(start, cancel);

    assert!(matches!(result, Err(PeerlinkError::Canceled { .. })));
    assert!(!harness.session.is_discovering());
    assert_eq!(harness.transport.count(MockOperation::StopDiscovery), 1);
    assert!(harness.drain_events().is_empty());

    harness.transport.release(MockOperation::StartDiscovery);
    harness.session.start_discovery().await.unwrap();
    assert!(harness.session.is_discovering());
}

#[tokio::test]
async fn test_stop_waits_for_inflight_start() {
    let mut harness = TestHarness::new().unwrap();
    harness.transport.stall(MockOperation::StartAdvertising);

    let start = harness.session.start_advertising();
    let stop_after_release = async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        harness.transport.release(MockOperation::StartAdvertising);
        harness.session.stop_advertising().await
    };
    let (started, stopped) = tokio::join!(start, stop_after_release);
    started.unwrap();
    stopped.unwrap();

    assert!(!harness.session.is_advertising());
    assert_eq!(advertising_events(&harness.drain_events()), vec![true, false]);
}
