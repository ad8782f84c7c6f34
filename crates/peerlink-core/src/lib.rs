//! Peerlink Core
//!
//! Platform-independent heart of the peerlink peer-discovery abstraction:
//! the device registry and its connection state machine, the closed set of
//! domain events, the event pipeline that carries them from native callback
//! threads to subscribers, and the outgoing transfer tracker.
//!
//! Nothing here talks to a radio. Native transports live behind the port in
//! `peerlink-runtime`; this crate only sees their raw notifications
//! ([`platform`]) and turns them into domain events ([`pipeline`]).

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod device;
pub mod errors;
pub mod event;
pub mod pipeline;
pub mod platform;
pub mod registry;
pub mod transfer;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{BufferPolicy, PeerlinkConfig, PipelineConfig, SessionConfig, TransferConfig};
pub use device::{Device, DeviceState};
pub use errors::{
    PeerlinkError, ProcessorError, Result, SessionKind, TransferError,
    TransportError,
};
pub use event::{DomainEvent, EventKind};
pub use pipeline::{
    ClusterAdapter, DeviceFilter, DuplicateSuppressor, EventAdapter, EventHandler, EventPipeline,
    EventProcessor, EventPublisher, FnProcessor, PipelineStats, PipelineStatsSnapshot,
    ProcessResult, ProcessorChain, SessionAdapter, Subscription,
};
pub use platform::{
    ClusterNotification, ConnectionStatusCode, SessionNotification, SessionPeer, SessionPeerState,
};
pub use registry::{DeviceRegistry, Observation, StateChange, TransitionOutcome};
pub use transfer::{
    OutgoingTransfer, ProgressSink, TransferCompletion, TransferProgress, TransferResult,
    TransferStatus, UNKNOWN_TOTAL,
};
pub use types::{DeviceId, EventId, PayloadId, SystemTimeSource, TimeSource, Timestamp};
