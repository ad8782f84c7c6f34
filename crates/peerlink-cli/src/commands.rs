//! Command handlers for the peerlink CLI

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use peerlink_core::{DeviceId, DomainEvent, Subscription, TransferProgress};
use peerlink_harness::{MockTransport, MockTransportConfig};
use peerlink_runtime::{
    Invitation, InvitationDecision, PeerSession, SendOptions, TransportKind,
};

use crate::cli::{Cli, Commands, ConfigFormat, TransportChoice};
use crate::config::CliAppConfig;
use crate::error::{CliError, Result};

const GUEST_ID: &str = "guest";

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: CliAppConfig) -> Result<()> {
        match cli.command {
            Commands::Simulate {
                peers,
                transport,
                realistic,
                payload_bytes,
            } => {
                let plan = SimulationPlan {
                    peers,
                    transport,
                    realistic,
                    payload_bytes,
                };
                let report = run_simulation(&config, &plan).await?;
                println!("{}", report);
                Ok(())
            }
            Commands::Config { format } => Self::handle_config_command(&config, format),
        }
    }

    fn handle_config_command(config: &CliAppConfig, format: ConfigFormat) -> Result<()> {
        let rendered = match format {
            ConfigFormat::Toml => config.to_toml()?,
            ConfigFormat::Json => config.to_json()?,
        };
        println!("{}", rendered);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Loopback Simulation
// ----------------------------------------------------------------------------

/// What the `simulate` command scripts
#[derive(Debug, Clone)]
pub struct SimulationPlan {
    pub peers: usize,
    pub transport: TransportChoice,
    pub realistic: bool,
    pub payload_bytes: usize,
}

/// Summary printed once the simulated session has shut down
#[derive(Debug, Clone, Default)]
pub struct SimulationReport {
    pub transport: Option<TransportKind>,
    pub discovered: usize,
    pub connected: usize,
    pub transfers_completed: usize,
    pub transfers_failed: usize,
    pub bytes_sent: u64,
    pub progress_updates: u64,
    pub data_received: usize,
    pub disconnected: usize,
    pub events_published: u64,
    pub elapsed: Duration,
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let transport = self
            .transport
            .map(|kind| kind.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        writeln!(f, "Simulation over {} transport", transport)?;
        writeln!(f, "  discovered:      {}", self.discovered)?;
        writeln!(f, "  connected:       {}", self.connected)?;
        writeln!(
            f,
            "  transfers:       {} completed, {} failed ({} bytes, {} progress updates)",
            self.transfers_completed, self.transfers_failed, self.bytes_sent, self.progress_updates
        )?;
        writeln!(f, "  data received:   {}", self.data_received)?;
        writeln!(f, "  disconnected:    {}", self.disconnected)?;
        writeln!(f, "  events:          {}", self.events_published)?;
        write!(f, "  elapsed:         {:?}", self.elapsed)
    }
}

/// Counts every event by kind so waiting for one kind never loses another
struct EventTally {
    events: Subscription,
    seen: HashMap<&'static str, usize>,
    timeout: Duration,
}

impl EventTally {
    fn new(events: Subscription, timeout: Duration) -> Self {
        Self {
            events,
            seen: HashMap::new(),
            timeout,
        }
    }

    fn count(&self, name: &str) -> usize {
        self.seen.get(name).copied().unwrap_or(0)
    }

    fn record(&mut self, event: &DomainEvent) {
        debug!("event: {}", event);
        *self.seen.entry(event.name()).or_default() += 1;
    }

    async fn wait_for(&mut self, name: &'static str, count: usize) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        while self.count(name) < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.events.recv()).await {
                Ok(Some(event)) => self.record(&event),
                Ok(None) => {
                    return Err(CliError::Simulation(format!(
                        "event stream closed while waiting for {}",
                        name
                    )))
                }
                Err(_) => {
                    return Err(CliError::Simulation(format!(
                        "timed out waiting for {} {} event(s), saw {}",
                        count,
                        name,
                        self.count(name)
                    )))
                }
            }
        }
        Ok(())
    }
}

/// Run a full session lifecycle against scripted peers.
///
/// Discovers `peers` devices and connects to each, accepts one inbound
/// invitation, sends a payload to every connected device, receives data
/// from the guest, then tears everything down.
pub async fn run_simulation(config: &CliAppConfig, plan: &SimulationPlan) -> Result<SimulationReport> {
    let started = Instant::now();
    let kind = match plan.transport {
        TransportChoice::Cluster => TransportKind::Cluster,
        TransportChoice::Session => TransportKind::Session,
    };
    let mock_config = if plan.realistic {
        MockTransportConfig::realistic()
    } else {
        MockTransportConfig::ideal()
    };

    let transport = Arc::new(MockTransport::new(kind, mock_config));
    let session = PeerSession::builder(transport.clone())
        .with_config(config.peerlink())
        .with_invitation_handler(|invitation: &Invitation| {
            info!("Accepting invitation from {}", invitation.device.id);
            InvitationDecision::Accept
        })
        .build()?;
    let mut tally = EventTally::new(
        session.subscribe(),
        Duration::from_millis(config.cli.event_timeout_ms),
    );
    transport.attach(session.callbacks());
    transport.set_service_id(&session.config().session.service_id);

    info!(
        "Simulating {} peer(s) over the {} transport as {:?}",
        plan.peers,
        kind,
        session.config().session.local_name
    );
    session.start_advertising().await?;
    session.start_discovery().await?;

    let peers: Vec<DeviceId> = (0..plan.peers)
        .map(|index| DeviceId::from(format!("peer-{}", index)))
        .collect();
    for (index, id) in peers.iter().enumerate() {
        transport.discover(id.as_str(), &format!("Peer {}", index));
    }
    tally.wait_for("DeviceFound", peers.len()).await?;

    for id in &peers {
        session.request_connection(id).await?;
    }
    tally.wait_for("ConnectionResponded", peers.len()).await?;

    transport.invite(GUEST_ID, "Guest");
    tally.wait_for("ConnectionResponded", peers.len() + 1).await?;

    let progress_updates = Arc::new(AtomicU64::new(0));
    let mut report = SimulationReport {
        transport: Some(kind),
        discovered: tally.count("DeviceFound"),
        ..Default::default()
    };

    let payload = vec![0x5a; plan.payload_bytes];
    let mut targets = peers.clone();
    targets.push(DeviceId::from(GUEST_ID));
    report.connected = targets
        .iter()
        .filter(|id| session.device(id).is_some_and(|device| device.state.is_connected()))
        .count();

    for id in &targets {
        let counter = progress_updates.clone();
        let options = SendOptions::new().with_progress(move |_: &TransferProgress| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        let handle = session.send(id, payload.clone(), options).await?;
        match handle.finish().await {
            Ok(progress) => {
                report.transfers_completed += 1;
                report.bytes_sent += progress.bytes_transferred;
            }
            Err(err) => {
                warn!("Transfer to {} failed: {}", id, err);
                report.transfers_failed += 1;
            }
        }
    }

    transport.deliver(GUEST_ID, b"hello from the guest".to_vec());
    tally.wait_for("DataReceived", 1).await?;

    transport.disconnect_from_remote(GUEST_ID);
    for id in &peers {
        session.disconnect(id).await?;
    }
    tally.wait_for("DeviceDisconnected", targets.len()).await?;

    session.stop_discovery().await?;
    session.stop_advertising().await?;
    session.shutdown().await;

    report.progress_updates = progress_updates.load(Ordering::Relaxed);
    report.data_received = tally.count("DataReceived");
    report.disconnected = tally.count("DeviceDisconnected");
    report.events_published = session.stats().published;
    report.elapsed = started.elapsed();
    Ok(report)
}
