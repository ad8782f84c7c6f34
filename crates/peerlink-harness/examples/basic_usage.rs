//! Basic usage of the peerlink test harness
//!
//! Discovers a scripted peer, connects to it and sends a payload that the
//! mock transport completes on its own.

use peerlink_core::{DeviceId, EventKind, PeerlinkConfig};
use peerlink_harness::{MockTransport, TestHarness};
use peerlink_runtime::SendOptions;

#[tokio::main]
async fn main() -> peerlink_core::Result<()> {
    let mut harness = TestHarness::with_transport(MockTransport::ideal(), PeerlinkConfig::testing())?;
    harness.session.start_discovery().await?;

    harness.transport.discover("A", "Alice");
    if let Some(event) = harness.next_event().await {
        println!("observed {}", event);
    }

    let alice = DeviceId::from("A");
    harness.session.request_connection(&alice).await?;
    harness
        .wait_for(|kind| matches!(kind, EventKind::ConnectionResponded { accepted: true, .. }))
        .await;

    let handle = harness
        .session
        .send(&alice, b"hello".to_vec(), SendOptions::new())
        .await?;
    match handle.finish().await {
        Ok(progress) => println!("sent: {}", progress),
        Err(err) => println!("send failed: {}", err),
    }

    harness.shutdown().await;
    Ok(())
}
