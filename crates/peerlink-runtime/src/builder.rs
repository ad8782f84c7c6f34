//! Peer session builder
//!
//! Wires registry, pipeline, managers and the invitation task over one
//! native transport.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use peerlink_core::{
    DeviceRegistry, DuplicateSuppressor, EventPipeline, EventProcessor,
    PeerlinkConfig, PeerlinkError, ProcessorChain, Result,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::SessionContext;
use crate::invitation::{run_invitation_task, HandlerSlot, InvitationHandler};
use crate::managers::{AdvertisingManager, ConnectionOrchestrator, DiscoveryManager};
use crate::session::PeerSession;
use crate::transport::NativeTransport;

// ----------------------------------------------------------------------------
// Session Builder
// ----------------------------------------------------------------------------

/// Builder for a [`PeerSession`]
pub struct PeerSessionBuilder {
    transport: Arc<dyn NativeTransport>,
    config: PeerlinkConfig,
    processors: Vec<Arc<dyn EventProcessor>>,
    invitation_handler: Option<Arc<dyn InvitationHandler>>,
}

impl PeerSessionBuilder {
    pub fn new(transport: Arc<dyn NativeTransport>) -> Self {
        Self {
            transport,
            config: PeerlinkConfig::default(),
            processors: Vec::new(),
            invitation_handler: None,
        }
    }

    pub fn with_config(mut self, config: PeerlinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Append a processor after the built-in ones
    pub fn with_processor<P: EventProcessor + 'static>(self, processor: P) -> Self {
        self.with_shared_processor(Arc::new(processor))
    }

    /// Append a processor the caller keeps a handle to, e.g. a `DeviceFilter`
    pub fn with_shared_processor(mut self, processor: Arc<dyn EventProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    /// Install the invitation handler; a second call replaces the first
    pub fn with_invitation_handler<H: InvitationHandler>(mut self, handler: H) -> Self {
        if self.invitation_handler.is_some() {
            warn!("Replacing the configured invitation handler; only one handler decides");
        }
        self.invitation_handler = Some(Arc::new(handler));
        self
    }

    fn processor_chain(&self) -> ProcessorChain {
        let mut chain = ProcessorChain::new();
        if let Some(window) = self.config.pipeline.duplicate_window() {
            chain.push(Arc::new(DuplicateSuppressor::new(
                window,
                self.config.pipeline.duplicate_capacity,
            )));
        }
        for processor in &self.processors {
            chain.push(processor.clone());
        }
        chain
    }

    /// Build the session; must be called inside a tokio runtime
    pub fn build(self) -> Result<PeerSession> {
        self.config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            PeerlinkError::config_error("a peer session must be built inside a tokio runtime")
        })?;

        let pipeline = EventPipeline::with_chain(&self.config.pipeline, self.processor_chain());
        let (invitation_tx, invitation_rx) = mpsc::unbounded_channel();
        let context = Arc::new(SessionContext::new(
            DeviceRegistry::new(),
            pipeline,
            &self.config.session.service_id,
            self.config.transfer.clone(),
            invitation_tx,
        )
        .with_ignored(self.config.session.blocked_devices.iter().cloned()));

        let handlers = HandlerSlot::default();
        if let Some(handler) = self.invitation_handler {
            handlers.install(handler);
        }

        let shutdown = CancellationToken::new();
        let invitation_task = runtime.spawn(run_invitation_task(
            invitation_rx,
            handlers.clone(),
            Arc::downgrade(&context),
            self.transport.clone(),
            shutdown.clone(),
        ));

        let start_timeout = self.config.session.start_timeout();
        info!(
            "Built peer session over {} transport for service {}",
            self.transport.kind(),
            self.config.session.service_id
        );

        Ok(PeerSession {
            advertising: AdvertisingManager::new(context.clone(), self.transport.clone(), start_timeout),
            discovery: DiscoveryManager::new(context.clone(), self.transport.clone(), start_timeout),
            connections: ConnectionOrchestrator::new(context.clone(), self.transport.clone()),
            config: self.config,
            context,
            transport: self.transport,
            handlers,
            shutdown,
            closed: AtomicBool::new(false),
            invitation_task: Mutex::new(Some(invitation_task)),
        })
    }
}
