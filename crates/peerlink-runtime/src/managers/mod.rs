//! Stateful managers for the peerlink runtime
//!
//! The advertising and discovery managers own the two single-instance native
//! activities; the connection orchestrator drives per-device commands.

pub mod connection;
pub mod delivery;
pub mod session;

pub use connection::ConnectionOrchestrator;
pub use delivery::{SendOptions, TransferHandle};
pub use session::{AdvertisingManager, DiscoveryManager};
