//! Error types for peerlink
//!
//! Errors fall into four groups: usage errors (an operation requested from the
//! wrong device or session state), transport errors reported by a native
//! transport, transfer outcomes, and best-effort notification failures raised
//! inside the event pipeline. Teardown races are not errors and have no variant.

use crate::device::DeviceState;
use crate::types::PayloadId;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Failures reported by a native transport command
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Native transport is not available on this platform: {reason}")]
    Unavailable { reason: String },
    #[error("Peer {peer_id} rejected the request")]
    Rejected { peer_id: String },
    #[error("Native {operation} failed: {reason}")]
    Failed { operation: String, reason: String },
    #[error("Native {operation} timed out after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },
}

impl TransportError {
    pub fn failed<O: Into<String>, R: Into<String>>(operation: O, reason: R) -> Self {
        TransportError::Failed {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

/// Terminal failure outcomes of an outgoing transfer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("Transfer {payload_id} failed: {reason}")]
    Failed { payload_id: PayloadId, reason: String },
    #[error("Transfer {payload_id} was canceled")]
    Canceled { payload_id: PayloadId },
    #[error("Transfer {payload_id} was abandoned before completing")]
    Abandoned { payload_id: PayloadId },
}

/// Error raised by a pipeline processor; always contained by the chain
#[derive(Debug, Clone, thiserror::Error)]
#[error("Processor {processor} failed: {reason}")]
pub struct ProcessorError {
    pub processor: String,
    pub reason: String,
}

impl ProcessorError {
    pub fn new<P: Into<String>, R: Into<String>>(processor: P, reason: R) -> Self {
        Self {
            processor: processor.into(),
            reason: reason.into(),
        }
    }
}

/// Which single-instance session an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SessionKind {
    Advertising,
    Discovery,
}

impl core::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SessionKind::Advertising => write!(f, "advertising"),
            SessionKind::Discovery => write!(f, "discovery"),
        }
    }
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Core error type for peerlink
#[derive(Debug, thiserror::Error)]
pub enum PeerlinkError {
    /// A start was requested while the session was already running
    #[error("{session} session is already active")]
    AlreadyActive { session: SessionKind },

    #[error("Cannot {operation} device {device_id} in state {state}")]
    InvalidTransition {
        device_id: String,
        state: DeviceState,
        operation: &'static str,
    },

    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: String },

    #[error("Payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Operation canceled: {operation}")]
    Canceled { operation: &'static str },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl PeerlinkError {
    pub fn invalid_transition<D: Into<String>>(
        device_id: D,
        state: DeviceState,
        operation: &'static str,
    ) -> Self {
        PeerlinkError::InvalidTransition {
            device_id: device_id.into(),
            state,
            operation,
        }
    }

    pub fn device_not_found<D: Into<String>>(device_id: D) -> Self {
        PeerlinkError::DeviceNotFound {
            device_id: device_id.into(),
        }
    }

    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        PeerlinkError::Configuration {
            reason: reason.into(),
        }
    }

    /// Whether the error is a usage error the caller caused
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            PeerlinkError::AlreadyActive { .. }
                | PeerlinkError::InvalidTransition { .. }
                | PeerlinkError::DeviceNotFound { .. }
                | PeerlinkError::PayloadTooLarge { .. }
        )
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, PeerlinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_errors_are_classified() {
        let err = PeerlinkError::AlreadyActive {
            session: SessionKind::Advertising,
        };
        assert!(err.is_usage_error());
        assert_eq!(err.to_string(), "advertising session is already active");

        let err = PeerlinkError::from(TransportError::failed("connect", "radio off"));
        assert!(!err.is_usage_error());
        assert_eq!(
            err.to_string(),
            "Transport error: Native connect failed: radio off"
        );
    }

    #[test]
    fn test_invalid_transition_message_names_state() {
        let err = PeerlinkError::invalid_transition("A", DeviceState::Discovered, "accept");
        assert_eq!(err.to_string(), "Cannot accept device A in state Discovered");
    }
}
