//! Centralized configuration
//!
//! Every tunable of the core lives here so the CLI and embedding
//! applications can layer one serde document over the defaults.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{PeerlinkError, Result};

// ----------------------------------------------------------------------------
// Pipeline Configuration
// ----------------------------------------------------------------------------

/// How the publisher buffers events for slow subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BufferPolicy {
    /// Never drop; memory grows with the slowest subscriber
    Unbounded,
    /// Keep at most `capacity` events per subscriber, discarding the oldest
    DropOldest { capacity: usize },
}

impl Default for BufferPolicy {
    fn default() -> Self {
        BufferPolicy::DropOldest { capacity: 256 }
    }
}

/// Configuration for the event pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub buffer: BufferPolicy,
    /// Window in which a repeated event for the same source is suppressed;
    /// zero disables duplicate suppression
    pub duplicate_window_ms: u64,
    /// Maximum number of sources the duplicate suppressor remembers
    pub duplicate_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer: BufferPolicy::default(),
            duplicate_window_ms: 500,
            duplicate_capacity: 1024,
        }
    }
}

impl PipelineConfig {
    pub fn duplicate_window(&self) -> Option<Duration> {
        (self.duplicate_window_ms > 0).then(|| Duration::from_millis(self.duplicate_window_ms))
    }

    /// Create configuration for low-memory environments
    pub fn low_memory() -> Self {
        Self {
            buffer: BufferPolicy::DropOldest { capacity: 32 },
            duplicate_window_ms: 500,
            duplicate_capacity: 128,
        }
    }

    /// Create configuration for bursty, high-volume sessions
    pub fn high_throughput() -> Self {
        Self {
            buffer: BufferPolicy::DropOldest { capacity: 4096 },
            duplicate_window_ms: 250,
            duplicate_capacity: 8192,
        }
    }

    /// Create configuration optimized for testing: nothing is dropped or suppressed
    pub fn testing() -> Self {
        Self {
            buffer: BufferPolicy::Unbounded,
            duplicate_window_ms: 0,
            duplicate_capacity: 16,
        }
    }
}

// ----------------------------------------------------------------------------
// Session Configuration
// ----------------------------------------------------------------------------

/// Configuration for advertising and discovery sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Service identifier advertised and scanned for
    pub service_id: String,
    /// Name the local device advertises under
    pub local_name: String,
    /// Upper bound on a native start call; zero waits indefinitely
    pub start_timeout_ms: u64,
    /// Device ids never tracked or reported, e.g. the local endpoint
    pub blocked_devices: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_id: "peerlink".to_string(),
            local_name: "peerlink-device".to_string(),
            start_timeout_ms: 10_000,
            blocked_devices: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn start_timeout(&self) -> Option<Duration> {
        (self.start_timeout_ms > 0).then(|| Duration::from_millis(self.start_timeout_ms))
    }

    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            service_id: "peerlink-test".to_string(),
            local_name: "test-device".to_string(),
            start_timeout_ms: 1_000,
            blocked_devices: Vec::new(),
        }
    }
}

// ----------------------------------------------------------------------------
// Transfer Configuration
// ----------------------------------------------------------------------------

/// Configuration for outgoing transfers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Default inactivity window for a send; zero disables the watchdog
    pub inactivity_timeout_ms: u64,
    /// Largest payload accepted by `send`
    pub max_payload_bytes: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: 30_000,
            max_payload_bytes: 32 * 1024 * 1024,
        }
    }
}

impl TransferConfig {
    pub fn inactivity_timeout(&self) -> Option<Duration> {
        (self.inactivity_timeout_ms > 0).then(|| Duration::from_millis(self.inactivity_timeout_ms))
    }

    /// Create configuration for low-memory environments
    pub fn low_memory() -> Self {
        Self {
            inactivity_timeout_ms: 15_000,
            max_payload_bytes: 1024 * 1024,
        }
    }

    /// Create configuration for bursty, high-volume sessions
    pub fn high_throughput() -> Self {
        Self {
            inactivity_timeout_ms: 60_000,
            max_payload_bytes: 256 * 1024 * 1024,
        }
    }

    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            inactivity_timeout_ms: 200,
            max_payload_bytes: 64 * 1024,
        }
    }
}

// ----------------------------------------------------------------------------
// Aggregate Configuration
// ----------------------------------------------------------------------------

/// Complete configuration of one peer session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerlinkConfig {
    pub pipeline: PipelineConfig,
    pub session: SessionConfig,
    pub transfer: TransferConfig,
}

impl PeerlinkConfig {
    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            pipeline: PipelineConfig::testing(),
            session: SessionConfig::testing(),
            transfer: TransferConfig::testing(),
        }
    }

    /// Create configuration for low-memory environments
    pub fn low_memory() -> Self {
        Self {
            pipeline: PipelineConfig::low_memory(),
            session: SessionConfig::default(),
            transfer: TransferConfig::low_memory(),
        }
    }

    /// Create configuration for bursty, high-volume sessions
    pub fn high_throughput() -> Self {
        Self {
            pipeline: PipelineConfig::high_throughput(),
            session: SessionConfig::default(),
            transfer: TransferConfig::high_throughput(),
        }
    }

    /// Reject configurations no session could run with
    pub fn validate(&self) -> Result<()> {
        if let BufferPolicy::DropOldest { capacity } = self.pipeline.buffer {
            if capacity == 0 {
                return Err(PeerlinkError::config_error(
                    "pipeline.buffer capacity must be greater than zero",
                ));
            }
        }
        if self.pipeline.duplicate_window_ms > 0 && self.pipeline.duplicate_capacity == 0 {
            return Err(PeerlinkError::config_error(
                "pipeline.duplicate_capacity must be greater than zero when suppression is enabled",
            ));
        }
        if self.session.service_id.trim().is_empty() {
            return Err(PeerlinkError::config_error("session.service_id must not be empty"));
        }
        if self.session.local_name.trim().is_empty() {
            return Err(PeerlinkError::config_error("session.local_name must not be empty"));
        }
        if self.transfer.max_payload_bytes == 0 {
            return Err(PeerlinkError::config_error(
                "transfer.max_payload_bytes must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        for config in [
            PeerlinkConfig::default(),
            PeerlinkConfig::testing(),
            PeerlinkConfig::low_memory(),
            PeerlinkConfig::high_throughput(),
        ] {
            assert!(config.validate().is_ok(), "{:?}", config);
        }
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let mut config = PeerlinkConfig::default();
        config.pipeline.buffer = BufferPolicy::DropOldest { capacity: 0 };
        assert!(matches!(
            config.validate(),
            Err(PeerlinkError::Configuration { .. })
        ));
    }

    #[test]
    fn test_empty_service_id_is_rejected() {
        let mut config = PeerlinkConfig::default();
        config.session.service_id = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_durations_disable_timers() {
        let config = PeerlinkConfig::testing();
        assert_eq!(config.pipeline.duplicate_window(), None);
        assert_eq!(
            config.transfer.inactivity_timeout(),
            Some(Duration::from_millis(200))
        );
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config: PeerlinkConfig =
            serde_json::from_str(r#"{"session": {"service_id": "chat"}}"#).unwrap();
        assert_eq!(config.session.service_id, "chat");
        assert_eq!(config.session.local_name, SessionConfig::default().local_name);
        assert_eq!(config.pipeline, PipelineConfig::default());
    }

    #[test]
    fn test_buffer_policy_serde_shape() {
        let json = serde_json::to_string(&BufferPolicy::DropOldest { capacity: 8 }).unwrap();
        assert_eq!(json, r#"{"policy":"drop_oldest","capacity":8}"#);
        let parsed: BufferPolicy = serde_json::from_str(r#"{"policy":"unbounded"}"#).unwrap();
        assert_eq!(parsed, BufferPolicy::Unbounded);
    }
}
