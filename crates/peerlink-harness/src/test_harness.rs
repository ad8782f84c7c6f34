//! High-level test harness
//!
//! Bundles a [`PeerSession`] over a [`MockTransport`] with a subscription
//! opened before anything happens, so tests can drive notifications and
//! assert on the exact events that came out.

use std::sync::Arc;
use std::time::Duration;

use peerlink_core::{DomainEvent, EventKind, PeerlinkConfig, Result, Subscription};
use peerlink_runtime::{PeerSession, PeerSessionBuilder};

use crate::mock_transport::MockTransport;

const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(1);

/// Install a `tracing` subscriber honouring `RUST_LOG`; safe to call repeatedly
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A session, its mock transport and an early subscription
pub struct TestHarness {
    pub session: PeerSession,
    pub transport: Arc<MockTransport>,
    events: Subscription,
}

impl TestHarness {
    /// Cluster mock transport with the testing configuration
    pub fn new() -> Result<Self> {
        Self::with_transport(MockTransport::cluster(), PeerlinkConfig::testing())
    }

    /// Session-kind mock transport with the testing configuration
    pub fn session_kind() -> Result<Self> {
        Self::with_transport(MockTransport::session(), PeerlinkConfig::testing())
    }

    pub fn with_transport(transport: MockTransport, config: PeerlinkConfig) -> Result<Self> {
        Self::with_builder(transport, |builder| builder.with_config(config))
    }

    /// Customise the builder before the session is built
    pub fn with_builder<F>(transport: MockTransport, configure: F) -> Result<Self>
    where
        F: FnOnce(PeerSessionBuilder) -> PeerSessionBuilder,
    {
        init_tracing();
        let transport = Arc::new(transport);
        let session = configure(PeerSession::builder(transport.clone())).build()?;
        let events = session.subscribe();
        // Notifications raised before any start command still reach the session.
        transport.attach(session.callbacks());
        transport.set_service_id(&session.config().session.service_id);
        Ok(Self {
            session,
            transport,
            events,
        })
    }

    /// Next event, or `None` after the default timeout
    pub async fn next_event(&mut self) -> Option<DomainEvent> {
        self.next_event_timeout(DEFAULT_EVENT_TIMEOUT).await
    }

    pub async fn next_event_timeout(&mut self, timeout: Duration) -> Option<DomainEvent> {
        tokio::time::timeout(timeout, self.events.recv())
            .await
            .ok()
            .flatten()
    }

    /// Skip events until one matches `predicate`
    pub async fn wait_for<P>(&mut self, mut predicate: P) -> Option<DomainEvent>
    where
        P: FnMut(&EventKind) -> bool,
    {
        let deadline = tokio::time::Instant::now() + DEFAULT_EVENT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let event = self.next_event_timeout(remaining).await?;
            if predicate(&event.kind) {
                return Some(event);
            }
        }
    }

    /// Everything already published, without waiting
    pub fn drain_events(&mut self) -> Vec<DomainEvent> {
        self.events.drain()
    }

    /// Let spawned tasks (invitation decisions, scripted peers) run
    pub async fn settle(&self) {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    pub async fn shutdown(self) {
        self.session.shutdown().await;
    }
}

/// Names of `events`, in order
pub fn event_names(events: &[DomainEvent]) -> Vec<&'static str> {
    events.iter().map(|event| event.kind.name()).collect()
}
