//! Mock Transport for Testing
//!
//! A scriptable, in-memory [`NativeTransport`]. It records every command,
//! can fail or stall chosen operations, and lets tests raise the native
//! notifications a real cluster or session binding would.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use peerlink_core::{
    ClusterNotification, ConnectionStatusCode, DeviceId, PayloadId, SessionNotification,
    SessionPeer, SessionPeerState, TransferProgress, TransferStatus, TransportError,
};
use peerlink_runtime::{
    AdvertiseRequest, DiscoverRequest, NativeCallbacks, NativeTransport, OutgoingPayload,
    TransportKind,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const DEFAULT_SERVICE_ID: &str = "peerlink";
const MOCK_AUTH_TOKEN: &str = "mock-0000";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Mock Transport Configuration
// ----------------------------------------------------------------------------

/// Configuration for mock transport behavior
#[derive(Debug, Clone)]
pub struct MockTransportConfig {
    /// Simulated command latency range (min, max) in milliseconds
    pub latency_range: (u64, u64),
    /// Answer every outbound connection request with an acceptance
    pub auto_accept_outbound: bool,
    /// Drive every send to completion with progress updates
    pub auto_complete_sends: bool,
    /// Bytes per simulated progress update
    pub progress_chunk: usize,
}

impl Default for MockTransportConfig {
    fn default() -> Self {
        Self {
            latency_range: (0, 0),
            auto_accept_outbound: false,
            auto_complete_sends: false,
            progress_chunk: 1024,
        }
    }
}

impl MockTransportConfig {
    /// Instant commands, peers that accept and sends that finish
    pub fn ideal() -> Self {
        Self {
            latency_range: (0, 0),
            auto_accept_outbound: true,
            auto_complete_sends: true,
            progress_chunk: 1024,
        }
    }

    /// Like `ideal` with a few milliseconds of jittered latency per command
    pub fn realistic() -> Self {
        Self {
            latency_range: (5, 40),
            auto_accept_outbound: true,
            auto_complete_sends: true,
            progress_chunk: 512,
        }
    }
}

// ----------------------------------------------------------------------------
// Recorded Commands
// ----------------------------------------------------------------------------

/// Native operations that can be scripted to fail or stall
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    StartAdvertising,
    StopAdvertising,
    StartDiscovery,
    StopDiscovery,
    RequestConnection,
    AcceptConnection,
    RejectConnection,
    Disconnect,
    Send,
}

/// One command the core issued, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCommand {
    StartAdvertising(AdvertiseRequest),
    StopAdvertising,
    StartDiscovery(DiscoverRequest),
    StopDiscovery,
    RequestConnection(DeviceId),
    AcceptConnection(DeviceId),
    RejectConnection(DeviceId),
    Disconnect(DeviceId),
    Send {
        device: DeviceId,
        payload_id: PayloadId,
        len: usize,
    },
}

impl MockCommand {
    pub fn operation(&self) -> MockOperation {
        match self {
            MockCommand::StartAdvertising(_) => MockOperation::StartAdvertising,
            MockCommand::StopAdvertising => MockOperation::StopAdvertising,
            MockCommand::StartDiscovery(_) => MockOperation::StartDiscovery,
            MockCommand::StopDiscovery => MockOperation::StopDiscovery,
            MockCommand::RequestConnection(_) => MockOperation::RequestConnection,
            MockCommand::AcceptConnection(_) => MockOperation::AcceptConnection,
            MockCommand::RejectConnection(_) => MockOperation::RejectConnection,
            MockCommand::Disconnect(_) => MockOperation::Disconnect,
            MockCommand::Send { .. } => MockOperation::Send,
        }
    }
}

#[derive(Debug, Default)]
pub struct MockTransportStats {
    pub commands: AtomicU64,
    pub failures_injected: AtomicU64,
    pub notifications_raised: AtomicU64,
}

// ----------------------------------------------------------------------------
// Mock Transport Implementation
// ----------------------------------------------------------------------------

/// Scriptable native transport for deterministic testing
pub struct MockTransport {
    kind: TransportKind,
    config: MockTransportConfig,
    commands: Mutex<Vec<MockCommand>>,
    failures: Mutex<HashMap<MockOperation, VecDeque<TransportError>>>,
    stalls: Mutex<HashMap<MockOperation, CancellationToken>>,
    callbacks: Mutex<Option<NativeCallbacks>>,
    service_id: Mutex<String>,
    names: Mutex<HashMap<String, String>>,
    stats: MockTransportStats,
}

impl MockTransport {
    pub fn new(kind: TransportKind, config: MockTransportConfig) -> Self {
        Self {
            kind,
            config,
            commands: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            stalls: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(None),
            service_id: Mutex::new(DEFAULT_SERVICE_ID.to_string()),
            names: Mutex::new(HashMap::new()),
            stats: MockTransportStats::default(),
        }
    }

    /// Cluster transport that only does what it is told
    pub fn cluster() -> Self {
        Self::new(TransportKind::Cluster, MockTransportConfig::default())
    }

    /// Session transport that only does what it is told
    pub fn session() -> Self {
        Self::new(TransportKind::Session, MockTransportConfig::default())
    }

    /// Cluster transport with instant, always-successful peers
    pub fn ideal() -> Self {
        Self::new(TransportKind::Cluster, MockTransportConfig::ideal())
    }

    pub fn config(&self) -> &MockTransportConfig {
        &self.config
    }

    pub fn stats(&self) -> &MockTransportStats {
        &self.stats
    }

    // ------------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------------

    /// Fail the next call of `operation` with `error`; queued failures are
    /// consumed in order
    pub fn fail_next(&self, operation: MockOperation, error: TransportError) {
        lock(&self.failures)
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Hold every call of `operation` until [`release`](Self::release)
    pub fn stall(&self, operation: MockOperation) {
        lock(&self.stalls)
            .entry(operation)
            .or_insert_with(CancellationToken::new);
    }

    pub fn release(&self, operation: MockOperation) {
        if let Some(gate) = lock(&self.stalls).remove(&operation) {
            gate.cancel();
        }
    }

    /// Use `callbacks` for raised notifications until a command registers others
    pub fn attach(&self, callbacks: NativeCallbacks) {
        *lock(&self.callbacks) = Some(callbacks);
    }

    /// Service id announced by discovered peers until a start command sets one
    pub fn set_service_id(&self, service_id: &str) {
        *lock(&self.service_id) = service_id.to_string();
    }

    pub fn callbacks(&self) -> Option<NativeCallbacks> {
        lock(&self.callbacks).clone()
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn commands(&self) -> Vec<MockCommand> {
        lock(&self.commands).clone()
    }

    pub fn count(&self, operation: MockOperation) -> usize {
        lock(&self.commands)
            .iter()
            .filter(|command| command.operation() == operation)
            .count()
    }

    pub fn last_command(&self) -> Option<MockCommand> {
        lock(&self.commands).last().cloned()
    }

    /// Payload id of the most recent send to `device`
    pub fn last_payload_for(&self, device: &DeviceId) -> Option<PayloadId> {
        lock(&self.commands).iter().rev().find_map(|command| match command {
            MockCommand::Send {
                device: target,
                payload_id,
                ..
            } if target == device => Some(*payload_id),
            _ => None,
        })
    }

    pub fn clear_commands(&self) {
        lock(&self.commands).clear();
    }

    // ------------------------------------------------------------------------
    // Command Execution
    // ------------------------------------------------------------------------

    async fn execute(&self, command: MockCommand) -> Result<(), TransportError> {
        let operation = command.operation();
        trace!("Mock transport: {:?}", command);
        lock(&self.commands).push(command);
        self.stats.commands.fetch_add(1, Ordering::Relaxed);

        self.simulate_latency().await;

        let stall = lock(&self.stalls).get(&operation).cloned();
        if let Some(gate) = stall {
            debug!("Mock transport: {:?} stalled", operation);
            gate.cancelled().await;
        }

        let failure = lock(&self.failures)
            .get_mut(&operation)
            .and_then(|queue| queue.pop_front());
        match failure {
            Some(err) => {
                self.stats.failures_injected.fetch_add(1, Ordering::Relaxed);
                debug!("Mock transport: injecting failure for {:?}: {}", operation, err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn latency(&self) -> Duration {
        let (min, max) = self.config.latency_range;
        if max == 0 || max < min {
            return Duration::ZERO;
        }
        Duration::from_millis(fastrand::u64(min..=max))
    }

    async fn simulate_latency(&self) {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn register(&self, callbacks: NativeCallbacks) {
        *lock(&self.callbacks) = Some(callbacks);
    }

    // ------------------------------------------------------------------------
    // Raising Notifications
    // ------------------------------------------------------------------------

    fn raise_cluster(&self, notification: ClusterNotification) -> bool {
        match self.callbacks() {
            Some(callbacks) => {
                self.stats.notifications_raised.fetch_add(1, Ordering::Relaxed);
                callbacks.cluster(notification);
                true
            }
            None => {
                warn!("Mock transport: no callbacks registered; dropping notification");
                false
            }
        }
    }

    fn raise_session(&self, notification: SessionNotification) -> bool {
        match self.callbacks() {
            Some(callbacks) => {
                self.stats.notifications_raised.fetch_add(1, Ordering::Relaxed);
                callbacks.session(notification);
                true
            }
            None => {
                warn!("Mock transport: no callbacks registered; dropping notification");
                false
            }
        }
    }

    fn peer(&self, id: &str) -> SessionPeer {
        let name = lock(&self.names).get(id).cloned().unwrap_or_default();
        SessionPeer::new(id, name)
    }

    /// Raise a cluster notification as the native binding would
    pub fn emit_cluster(&self, notification: ClusterNotification) -> bool {
        self.raise_cluster(notification)
    }

    /// Raise a session notification as the native binding would
    pub fn emit_session(&self, notification: SessionNotification) -> bool {
        self.raise_session(notification)
    }

    /// A peer advertising the current service id comes into range
    pub fn discover(&self, id: &str, name: &str) -> bool {
        lock(&self.names).insert(id.to_string(), name.to_string());
        match self.kind {
            TransportKind::Cluster => {
                let service_id = lock(&self.service_id).clone();
                self.raise_cluster(ClusterNotification::EndpointFound {
                    endpoint_id: id.to_string(),
                    endpoint_name: name.to_string(),
                    service_id,
                })
            }
            TransportKind::Session => self.raise_session(SessionNotification::FoundPeer {
                peer: SessionPeer::new(id, name),
                discovery_info: Default::default(),
            }),
        }
    }

    pub fn lose(&self, id: &str) -> bool {
        match self.kind {
            TransportKind::Cluster => self.raise_cluster(ClusterNotification::EndpointLost {
                endpoint_id: id.to_string(),
            }),
            TransportKind::Session => self.raise_session(SessionNotification::LostPeer {
                peer: self.peer(id),
            }),
        }
    }

    /// A remote peer invites the local side to connect
    pub fn invite(&self, id: &str, name: &str) -> bool {
        lock(&self.names).insert(id.to_string(), name.to_string());
        match self.kind {
            TransportKind::Cluster => self.raise_cluster(ClusterNotification::ConnectionInitiated {
                endpoint_id: id.to_string(),
                endpoint_name: name.to_string(),
                authentication_token: MOCK_AUTH_TOKEN.to_string(),
                is_incoming: true,
            }),
            TransportKind::Session => self.raise_session(SessionNotification::ReceivedInvitation {
                peer: SessionPeer::new(id, name),
                context: None,
            }),
        }
    }

    /// The remote side accepted a pending request
    pub fn accept_from_remote(&self, id: &str) -> bool {
        match self.kind {
            TransportKind::Cluster => self.raise_cluster(ClusterNotification::ConnectionResult {
                endpoint_id: id.to_string(),
                status: ConnectionStatusCode::Ok,
            }),
            TransportKind::Session => self.raise_session(SessionNotification::PeerStateChanged {
                peer: self.peer(id),
                state: SessionPeerState::Connected,
            }),
        }
    }

    /// The remote side declined a pending request
    pub fn reject_from_remote(&self, id: &str) -> bool {
        match self.kind {
            TransportKind::Cluster => self.raise_cluster(ClusterNotification::ConnectionResult {
                endpoint_id: id.to_string(),
                status: ConnectionStatusCode::Rejected,
            }),
            TransportKind::Session => self.raise_session(SessionNotification::PeerStateChanged {
                peer: self.peer(id),
                state: SessionPeerState::NotConnected,
            }),
        }
    }

    /// The link to a connected peer dropped
    pub fn disconnect_from_remote(&self, id: &str) -> bool {
        match self.kind {
            TransportKind::Cluster => self.raise_cluster(ClusterNotification::Disconnected {
                endpoint_id: id.to_string(),
            }),
            TransportKind::Session => self.raise_session(SessionNotification::PeerStateChanged {
                peer: self.peer(id),
                state: SessionPeerState::NotConnected,
            }),
        }
    }

    /// Bytes arrive from a connected peer
    pub fn deliver(&self, id: &str, bytes: Vec<u8>) -> bool {
        match self.kind {
            TransportKind::Cluster => self.raise_cluster(ClusterNotification::PayloadReceived {
                endpoint_id: id.to_string(),
                payload_id: PayloadId::generate(),
                bytes,
            }),
            TransportKind::Session => self.raise_session(SessionNotification::ReceivedData {
                peer: self.peer(id),
                bytes,
            }),
        }
    }

    /// Report progress of an outgoing payload.
    ///
    /// The session transport only reports completion, so non-terminal
    /// progress is not raised there.
    pub fn progress(&self, id: &str, progress: TransferProgress) -> bool {
        match self.kind {
            TransportKind::Cluster => {
                self.raise_cluster(ClusterNotification::PayloadTransferUpdate {
                    endpoint_id: id.to_string(),
                    payload_id: progress.payload_id,
                    bytes_transferred: progress.bytes_transferred,
                    total_bytes: progress.total_bytes,
                    status: progress.status,
                })
            }
            TransportKind::Session => {
                let error = match progress.status {
                    TransferStatus::InProgress => return false,
                    TransferStatus::Success => None,
                    TransferStatus::Failure => Some("send failed".to_string()),
                    TransferStatus::Canceled => Some("send canceled".to_string()),
                };
                self.raise_session(SessionNotification::SendCompleted {
                    peer: self.peer(id),
                    payload_id: progress.payload_id,
                    bytes: progress.bytes_transferred,
                    error,
                })
            }
        }
    }

    // ------------------------------------------------------------------------
    // Automatic Peers
    // ------------------------------------------------------------------------

    fn spawn_remote_acceptance(&self, device: &DeviceId, callbacks: NativeCallbacks) {
        let latency = self.latency();
        let kind = self.kind;
        let peer = self.peer(device.as_str());
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            match kind {
                TransportKind::Cluster => callbacks.cluster(ClusterNotification::ConnectionResult {
                    endpoint_id: peer.id,
                    status: ConnectionStatusCode::Ok,
                }),
                TransportKind::Session => callbacks.session(SessionNotification::PeerStateChanged {
                    peer,
                    state: SessionPeerState::Connected,
                }),
            }
        });
    }

    fn spawn_send_completion(&self, device: &DeviceId, payload: &OutgoingPayload) {
        let Some(callbacks) = self.callbacks() else {
            return;
        };
        let latency = self.latency();
        let kind = self.kind;
        let peer = self.peer(device.as_str());
        let payload_id = payload.payload_id;
        let total = payload.bytes.len() as u64;
        let chunk = self.config.progress_chunk.max(1) as u64;

        tokio::spawn(async move {
            if kind == TransportKind::Session {
                tokio::time::sleep(latency).await;
                callbacks.session(SessionNotification::SendCompleted {
                    peer,
                    payload_id,
                    bytes: total,
                    error: None,
                });
                return;
            }

            let mut sent = 0u64;
            while sent < total {
                tokio::time::sleep(latency).await;
                sent = (sent + chunk).min(total);
                let status = if sent == total {
                    TransferStatus::Success
                } else {
                    TransferStatus::InProgress
                };
                callbacks.cluster(ClusterNotification::PayloadTransferUpdate {
                    endpoint_id: peer.id.clone(),
                    payload_id,
                    bytes_transferred: sent,
                    total_bytes: total as i64,
                    status,
                });
            }
            if total == 0 {
                callbacks.cluster(ClusterNotification::PayloadTransferUpdate {
                    endpoint_id: peer.id,
                    payload_id,
                    bytes_transferred: 0,
                    total_bytes: 0,
                    status: TransferStatus::Success,
                });
            }
        });
    }
}

impl core::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MockTransport")
            .field("kind", &self.kind)
            .field("config", &self.config)
            .field("commands", &lock(&self.commands).len())
            .finish()
    }
}

#[async_trait]
impl NativeTransport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn start_advertising(
        &self,
        request: AdvertiseRequest,
        callbacks: NativeCallbacks,
    ) -> Result<(), TransportError> {
        *lock(&self.service_id) = request.service_id.clone();
        self.execute(MockCommand::StartAdvertising(request)).await?;
        self.register(callbacks);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), TransportError> {
        self.execute(MockCommand::StopAdvertising).await
    }

    async fn start_discovery(
        &self,
        request: DiscoverRequest,
        callbacks: NativeCallbacks,
    ) -> Result<(), TransportError> {
        *lock(&self.service_id) = request.service_id.clone();
        self.execute(MockCommand::StartDiscovery(request)).await?;
        self.register(callbacks);
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), TransportError> {
        self.execute(MockCommand::StopDiscovery).await
    }

    async fn request_connection(
        &self,
        device: &DeviceId,
        callbacks: NativeCallbacks,
    ) -> Result<(), TransportError> {
        self.execute(MockCommand::RequestConnection(device.clone()))
            .await?;
        if self.config.auto_accept_outbound {
            self.spawn_remote_acceptance(device, callbacks.clone());
        }
        self.register(callbacks);
        Ok(())
    }

    async fn accept_connection(&self, device: &DeviceId) -> Result<(), TransportError> {
        self.execute(MockCommand::AcceptConnection(device.clone()))
            .await
    }

    async fn reject_connection(&self, device: &DeviceId) -> Result<(), TransportError> {
        self.execute(MockCommand::RejectConnection(device.clone()))
            .await
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<(), TransportError> {
        self.execute(MockCommand::Disconnect(device.clone())).await
    }

    async fn send(&self, device: &DeviceId, payload: OutgoingPayload) -> Result<(), TransportError> {
        self.execute(MockCommand::Send {
            device: device.clone(),
            payload_id: payload.payload_id,
            len: payload.bytes.len(),
        })
        .await?;
        if self.config.auto_complete_sends {
            self.spawn_send_completion(device, &payload);
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
