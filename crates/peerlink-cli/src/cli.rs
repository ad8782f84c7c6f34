//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path (defaults to ./peerlink.toml when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Start from a named configuration preset instead of the defaults
    #[arg(long, value_enum)]
    pub preset: Option<Preset>,

    /// Override the service id advertised and discovered
    #[arg(long)]
    pub service_id: Option<String>,

    /// Override the local name shown to peers
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a scripted loopback session against simulated peers
    Simulate {
        /// Number of peers to discover and connect to
        #[arg(short, long, default_value_t = 3)]
        peers: usize,
        /// Native transport shape to simulate
        #[arg(short, long, value_enum, default_value_t = TransportChoice::Cluster)]
        transport: TransportChoice,
        /// Add jittered latency to every native command
        #[arg(long)]
        realistic: bool,
        /// Size of the payload sent to each connected peer
        #[arg(long, default_value_t = 4096)]
        payload_bytes: usize,
    },
    /// Print the effective configuration after all layers are applied
    Config {
        #[arg(short, long, value_enum, default_value_t = ConfigFormat::Toml)]
        format: ConfigFormat,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Testing,
    LowMemory,
    HighThroughput,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportChoice {
    /// Endpoint-oriented cluster discovery
    Cluster,
    /// Peer-object-oriented multi-peer session
    Session,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}
