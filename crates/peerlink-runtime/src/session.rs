//! Peer session facade
//!
//! A [`PeerSession`] is what applications hold: it exposes the event stream,
//! a device snapshot and every command, over one native transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use peerlink_core::{
    Device, DeviceId, DeviceState, EventHandler, PeerlinkConfig, PipelineStatsSnapshot, Result,
    Subscription,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::builder::PeerSessionBuilder;
use crate::context::SessionContext;
use crate::invitation::{HandlerSlot, InvitationHandler};
use crate::managers::{
    AdvertisingManager, ConnectionOrchestrator, DiscoveryManager, SendOptions, TransferHandle,
};
use crate::transport::{AdvertiseRequest, DiscoverRequest, NativeCallbacks, NativeTransport, TransportKind};

// ----------------------------------------------------------------------------
// Peer Session
// ----------------------------------------------------------------------------

/// Lifecycle and event orchestration over one native transport
pub struct PeerSession {
    pub(crate) config: PeerlinkConfig,
    pub(crate) context: Arc<SessionContext>,
    pub(crate) transport: Arc<dyn NativeTransport>,
    pub(crate) advertising: AdvertisingManager,
    pub(crate) discovery: DiscoveryManager,
    pub(crate) connections: ConnectionOrchestrator,
    pub(crate) handlers: HandlerSlot,
    /// Cancels in-flight operations and the invitation task on shutdown
    pub(crate) shutdown: CancellationToken,
    pub(crate) closed: AtomicBool,
    pub(crate) invitation_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerSession {
    pub fn builder(transport: Arc<dyn NativeTransport>) -> PeerSessionBuilder {
        PeerSessionBuilder::new(transport)
    }

    pub fn config(&self) -> &PeerlinkConfig {
        &self.config
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    /// Subscribe to every domain event published from now on
    pub fn subscribe(&self) -> Subscription {
        self.context.pipeline().subscribe()
    }

    /// Drive `handler` on its own task; its failures never reach publishers
    pub fn spawn_handler<H: EventHandler>(&self, handler: H) -> JoinHandle<()> {
        self.context.pipeline().spawn_handler(handler)
    }

    /// Point-in-time copy of all known devices
    pub fn devices(&self) -> Vec<Device> {
        self.context.registry().devices()
    }

    pub fn device(&self, id: &DeviceId) -> Option<Device> {
        self.context.registry().get(id)
    }

    /// Shared state behind this session
    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.context.pipeline().stats()
    }

    pub fn in_flight_transfers(&self) -> usize {
        self.context.in_flight_transfers()
    }

    /// Callbacks for bindings that deliver notifications outside a start
    /// or connect registration
    pub fn callbacks(&self) -> NativeCallbacks {
        NativeCallbacks::new(&self.context)
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    pub fn advertising(&self) -> &AdvertisingManager {
        &self.advertising
    }

    pub fn discovery(&self) -> &DiscoveryManager {
        &self.discovery
    }

    pub fn connections(&self) -> &ConnectionOrchestrator {
        &self.connections
    }

    /// Advertise under the configured local name and service id
    pub async fn start_advertising(&self) -> Result<()> {
        let request = AdvertiseRequest {
            local_name: self.config.session.local_name.clone(),
            service_id: self.config.session.service_id.clone(),
        };
        self.advertising.start(request, &self.shutdown).await
    }

    pub async fn stop_advertising(&self) -> Result<()> {
        self.advertising.stop(&self.shutdown).await
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising.is_active()
    }

    /// Discover devices advertising the configured service id
    pub async fn start_discovery(&self) -> Result<()> {
        let request = DiscoverRequest {
            service_id: self.config.session.service_id.clone(),
        };
        self.discovery.start(request, &self.shutdown).await
    }

    pub async fn stop_discovery(&self) -> Result<()> {
        self.discovery.stop(&self.shutdown).await
    }

    pub fn is_discovering(&self) -> bool {
        self.discovery.is_active()
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    pub async fn request_connection(&self, id: &DeviceId) -> Result<()> {
        self.connections.request_connection(id, &self.shutdown).await
    }

    pub async fn respond_to_connection(&self, id: &DeviceId, accept: bool) -> Result<()> {
        self.connections
            .respond_to_connection(id, accept, &self.shutdown)
            .await
    }

    pub async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        self.connections.disconnect(id, &self.shutdown).await
    }

    pub async fn send(&self, id: &DeviceId, bytes: Vec<u8>, options: SendOptions) -> Result<TransferHandle> {
        self.connections.send(id, bytes, options, &self.shutdown).await
    }

    /// Install the invitation handler, replacing any current one
    pub fn set_invitation_handler<H: InvitationHandler>(&self, handler: H) -> bool {
        self.handlers.install(Arc::new(handler))
    }

    /// Remove the invitation handler; requests then wait for an explicit response
    pub fn clear_invitation_handler(&self) -> bool {
        self.handlers.clear()
    }

    pub fn has_invitation_handler(&self) -> bool {
        self.handlers.is_installed()
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop both sessions, disconnect connected devices, cancel in-flight
    /// transfers, clear the registry and close the pipeline.
    ///
    /// Every step is best effort; calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down peer session");
        self.shutdown.cancel();

        // In-flight operations are canceled above; teardown itself must run.
        let teardown = CancellationToken::new();
        if let Err(err) = self.advertising.stop(&teardown).await {
            warn!("Stopping advertising during shutdown failed: {}", err);
        }
        if let Err(err) = self.discovery.stop(&teardown).await {
            warn!("Stopping discovery during shutdown failed: {}", err);
        }

        for device in self.context.registry().devices_in(DeviceState::Connected) {
            if let Err(err) = self.connections.disconnect(&device.id, &teardown).await {
                debug!("Disconnect of {} during shutdown: {}", device.id, err);
            }
        }

        let canceled = self.context.cancel_transfers();
        let cleared = self.context.registry().clear();
        self.context.pipeline().close();

        let task = self
            .invitation_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                debug!("Invitation task ended abnormally: {}", err);
            }
        }

        info!(
            "Peer session shut down ({} transfers canceled, {} devices cleared)",
            canceled, cleared
        );
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl core::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PeerSession")
            .field("transport", &self.transport.kind())
            .field("advertising", &self.is_advertising())
            .field("discovering", &self.is_discovering())
            .field("context", &self.context)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Process-wide Default
// ----------------------------------------------------------------------------

static DEFAULT_SESSION: OnceLock<Arc<PeerSession>> = OnceLock::new();
static DEFAULT_SESSION_INIT: Mutex<()> = Mutex::new(());

/// The process-wide default session, built by `factory` on first use.
///
/// `factory` runs at most once successfully; concurrent first callers wait
/// for it. A failed build is returned and the next call tries again.
pub fn default_session<F>(factory: F) -> Result<Arc<PeerSession>>
where
    F: FnOnce() -> Result<PeerSession>,
{
    if let Some(session) = DEFAULT_SESSION.get() {
        return Ok(session.clone());
    }

    let _init = DEFAULT_SESSION_INIT
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(session) = DEFAULT_SESSION.get() {
        return Ok(session.clone());
    }

    let session = Arc::new(factory()?);
    info!("Default peer session initialized");
    Ok(DEFAULT_SESSION.get_or_init(|| session).clone())
}

/// The default session, if one was built
pub fn try_default_session() -> Option<Arc<PeerSession>> {
    DEFAULT_SESSION.get().cloned()
}
