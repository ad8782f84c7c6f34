//! Peerlink Runtime
//!
//! Orchestration layer of the peerlink peer-discovery abstraction:
//! - `NativeTransport`: the port native cluster/session bindings implement
//! - `NativeCallbacks`: weak callback registrations handed to those bindings
//! - Advertising and discovery session managers
//! - `ConnectionOrchestrator`: invitation, connect, disconnect and send
//! - `PeerSession`: the facade applications hold, built by `PeerSessionBuilder`
//!
//! `peerlink-core` provides the registry, events and pipeline this crate drives.

pub mod builder;
pub mod context;
pub mod invitation;
pub mod managers;
pub mod session;
pub mod transport;

pub use builder::PeerSessionBuilder;
pub use context::SessionContext;
pub use invitation::{Invitation, InvitationDecision, InvitationHandler};
pub use managers::{
    AdvertisingManager, ConnectionOrchestrator, DiscoveryManager, SendOptions, TransferHandle,
};
pub use session::{default_session, try_default_session, PeerSession};
pub use transport::{
    AdvertiseRequest, DiscoverRequest, NativeCallbacks, NativeTransport, OutgoingPayload,
    TransportKind,
};

// Re-export core types for convenience
pub use peerlink_core::{
    Device, DeviceId, DeviceState, DomainEvent, EventKind, PayloadId, PeerlinkConfig,
    PeerlinkError, Result, Subscription, TransferError, TransferProgress, TransferStatus,
    TransportError,
};
