//! Event pipeline: adapter, processor chain, publisher
//!
//! ```text
//! native callback -> EventAdapter -> (registry reconcile) -> ProcessorChain -> EventPublisher -> subscribers
//! ```
//!
//! Each stage is usable on its own. [`EventPipeline`] wires the processor
//! chain to a publisher and adds subscriber handler isolation.

pub mod adapter;
pub mod processor;
pub mod publisher;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::PipelineConfig;
use crate::errors::Result;
use crate::event::DomainEvent;

pub use adapter::{ClusterAdapter, EventAdapter, SessionAdapter};
pub use processor::{
    DeviceFilter, DuplicateSuppressor, EventProcessor, FnProcessor, ProcessResult, ProcessorChain,
};
pub use publisher::{EventPublisher, Subscription};

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Counters shared by every pipeline stage
#[derive(Debug, Default)]
pub struct PipelineStats {
    published: AtomicU64,
    dropped_by_processor: AtomicU64,
    processor_failures: AtomicU64,
    publish_after_close: AtomicU64,
    handler_failures: AtomicU64,
    lagged: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatsSnapshot {
    pub published: u64,
    pub dropped_by_processor: u64,
    pub processor_failures: u64,
    pub publish_after_close: u64,
    pub handler_failures: u64,
    /// Events skipped by lagging subscribers under `DropOldest`
    pub lagged: u64,
}

impl PipelineStats {
    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped_by_processor.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_processor_failure(&self) {
        self.processor_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_publish_after_close(&self) {
        self.publish_after_close.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lagged(&self, skipped: u64) {
        self.lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            dropped_by_processor: self.dropped_by_processor.load(Ordering::Relaxed),
            processor_failures: self.processor_failures.load(Ordering::Relaxed),
            publish_after_close: self.publish_after_close.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            lagged: self.lagged.load(Ordering::Relaxed),
        }
    }
}

// ----------------------------------------------------------------------------
// Subscriber Handlers
// ----------------------------------------------------------------------------

/// Application-side consumer driven on its own task by
/// [`EventPipeline::spawn_handler`]
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: DomainEvent) -> Result<()>;
}

// ----------------------------------------------------------------------------
// Event Pipeline
// ----------------------------------------------------------------------------

/// Processor chain plus publisher
pub struct EventPipeline {
    chain: ProcessorChain,
    publisher: EventPublisher,
    stats: Arc<PipelineStats>,
}

impl EventPipeline {
    /// Pipeline with the built-in processors `config` enables
    pub fn new(config: &PipelineConfig) -> Self {
        let mut chain = ProcessorChain::new();
        if let Some(window) = config.duplicate_window() {
            chain.push(Arc::new(DuplicateSuppressor::new(
                window,
                config.duplicate_capacity,
            )));
        }
        Self::with_chain(config, chain)
    }

    pub fn with_chain(config: &PipelineConfig, chain: ProcessorChain) -> Self {
        let stats = Arc::new(PipelineStats::default());
        Self {
            chain,
            publisher: EventPublisher::new(config.buffer, stats.clone()),
            stats,
        }
    }

    /// Run `event` through the processor chain and publish what survives.
    ///
    /// Returns whether the event reached the publisher.
    pub fn emit(&self, event: DomainEvent) -> bool {
        match self.chain.run(event, &self.stats) {
            Some(event) => self.publisher.publish(event),
            None => false,
        }
    }

    /// Adapt a raw notification and emit the result without reconciliation.
    ///
    /// Session code reconciles against the registry first and uses
    /// [`EventPipeline::emit`]; this is for consumers of adapters alone.
    pub fn ingest<A: EventAdapter>(&self, adapter: &A, input: &A::Input) -> bool {
        match adapter.transform(input) {
            Some(event) => self.emit(event),
            None => false,
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.publisher.subscribe()
    }

    /// Drive `handler` on its own task until the pipeline closes.
    ///
    /// Handler errors and panics are logged and counted; the loop moves on
    /// to the next event.
    pub fn spawn_handler<H: EventHandler>(&self, handler: H) -> JoinHandle<()> {
        let mut subscription = self.subscribe();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let name = event.name();
                match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        warn!("Event handler failed on {}: {}", name, err);
                        stats.record_handler_failure();
                    }
                    Err(_) => {
                        error!("Event handler panicked on {}", name);
                        stats.record_handler_failure();
                    }
                }
            }
            debug!("Event handler finished: pipeline closed");
        })
    }

    /// Close the publisher; later emits are silent no-ops
    pub fn close(&self) {
        self.publisher.close();
    }

    pub fn is_closed(&self) -> bool {
        self.publisher.is_closed()
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn processors(&self) -> &ProcessorChain {
        &self.chain
    }
}

impl core::fmt::Debug for EventPipeline {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventPipeline")
            .field("chain", &self.chain)
            .field("publisher", &self.publisher)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferPolicy;
    use crate::device::Device;
    use crate::errors::{PeerlinkError, ProcessorError};
    use crate::platform::ClusterNotification;
    use std::sync::Mutex;

    fn found(id: &str) -> DomainEvent {
        DomainEvent::device_found(Device::discovered(id, None))
    }

    #[tokio::test]
    async fn test_processor_failure_does_not_block_other_events() {
        let chain = ProcessorChain::new().with(Arc::new(FnProcessor::new(
            "rejects-a",
            |event: DomainEvent| match event.device() {
                Some(device) if device.id.as_str() == "A" => {
                    Err(ProcessorError::new("rejects-a", "always fails"))
                }
                _ => Ok(Some(event)),
            },
        )));
        let pipeline = EventPipeline::with_chain(&PipelineConfig::testing(), chain);
        let mut first = pipeline.subscribe();
        let mut second = pipeline.subscribe();

        assert!(!pipeline.emit(found("A")));
        assert!(pipeline.emit(found("B")));

        for subscription in [&mut first, &mut second] {
            let event = subscription.recv().await.unwrap();
            assert_eq!(event.device().unwrap().id.as_str(), "B");
        }
        let stats = pipeline.stats();
        assert_eq!(stats.processor_failures, 1);
        assert_eq!(stats.published, 1);
    }

    #[tokio::test]
    async fn test_default_pipeline_suppresses_duplicates() {
        let config = PipelineConfig {
            buffer: BufferPolicy::Unbounded,
            ..PipelineConfig::default()
        };
        let pipeline = EventPipeline::new(&config);
        let mut subscription = pipeline.subscribe();

        assert!(pipeline.emit(found("A")));
        assert!(!pipeline.emit(found("A")));
        assert_eq!(subscription.drain().len(), 1);
        assert_eq!(pipeline.stats().dropped_by_processor, 1);
    }

    #[tokio::test]
    async fn test_ingest_runs_the_adapter() {
        let pipeline = EventPipeline::new(&PipelineConfig::testing());
        let mut subscription = pipeline.subscribe();
        let adapter = ClusterAdapter::new();

        assert!(!pipeline.ingest(
            &adapter,
            &ClusterNotification::EndpointLost {
                endpoint_id: String::new()
            }
        ));
        assert!(pipeline.ingest(
            &adapter,
            &ClusterNotification::EndpointLost {
                endpoint_id: "A".into()
            }
        ));
        assert_eq!(subscription.drain().len(), 1);
    }

    struct Recording {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EventHandler for Recording {
        async fn handle(&self, event: DomainEvent) -> Result<()> {
            let id = event.device().map(|d| d.id.to_string()).unwrap_or_default();
            if id == "panic" {
                panic!("handler bug");
            }
            if id == "fail" {
                return Err(PeerlinkError::device_not_found(id));
            }
            self.seen.lock().unwrap().push(id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handler_failures_are_isolated() {
        let pipeline = EventPipeline::new(&PipelineConfig::testing());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let task = pipeline.spawn_handler(Recording { seen: seen.clone() });

        for id in ["A", "panic", "B", "fail", "C"] {
            pipeline.emit(found(id));
        }
        pipeline.close();
        task.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["A", "B", "C"]);
        assert_eq!(pipeline.stats().handler_failures, 2);
    }
}
