//! Peerlink Harness - Testing Framework
//!
//! Scriptable in-memory native transport and a session-level test harness
//! for the peerlink runtime.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let mut harness = TestHarness::new()?;
//! harness.transport.discover("A", "Alice");
//! let found = harness.next_event().await;
//! ```

pub mod mock_transport;
pub mod test_harness;

pub use mock_transport::{
    MockCommand, MockOperation, MockTransport, MockTransportConfig, MockTransportStats,
};
pub use test_harness::{event_names, init_tracing, TestHarness};
