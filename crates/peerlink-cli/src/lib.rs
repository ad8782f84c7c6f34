//! Peerlink CLI
//!
//! Layered configuration and a loopback demonstration of the peerlink
//! session lifecycle over the in-memory mock transport.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands, ConfigFormat, Preset, TransportChoice};
pub use commands::{run_simulation, CommandDispatcher, SimulationPlan, SimulationReport};
pub use config::{CliAppConfig, CliConfig, CliOverrides};
pub use error::{CliError, Result};
