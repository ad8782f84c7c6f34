//! Peerlink CLI Configuration Management
//!
//! Configuration is layered with figment, lowest priority first:
//! defaults (or a named preset), the configuration file (`peerlink.toml`
//! or `--config`), `PEERLINK_*` environment variables, then command line
//! flags. Nested keys in the environment are separated by a double
//! underscore, e.g. `PEERLINK_SESSION__SERVICE_ID=demo`.

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use peerlink_core::{PeerlinkConfig, PipelineConfig, SessionConfig, TransferConfig};

use crate::cli::{Cli, Preset};
use crate::error::{CliError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "peerlink.toml";
pub const ENV_PREFIX: &str = "PEERLINK_";

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the peerlink CLI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliAppConfig {
    pub pipeline: PipelineConfig,
    pub session: SessionConfig,
    pub transfer: TransferConfig,
    pub cli: CliConfig,
}

/// CLI-specific configuration options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Enable verbose logging output
    pub verbose: bool,
    /// `tracing` filter directive used when `RUST_LOG` is unset
    pub log_filter: String,
    /// How long the simulation waits for any single expected event
    pub event_timeout_ms: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_filter: "info".to_string(),
            event_timeout_ms: 2_000,
        }
    }
}

/// Values taken from command line flags; `None` leaves lower layers alone
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_file: Option<PathBuf>,
    pub preset: Option<Preset>,
    pub service_id: Option<String>,
    pub local_name: Option<String>,
    pub verbose: bool,
}

impl From<&Cli> for CliOverrides {
    fn from(cli: &Cli) -> Self {
        Self {
            config_file: cli.config.clone(),
            preset: cli.preset,
            service_id: cli.service_id.clone(),
            local_name: cli.name.clone(),
            verbose: cli.verbose,
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl CliAppConfig {
    /// Defaults with the core sections replaced by a named preset
    pub fn from_preset(preset: Preset) -> Self {
        let core = match preset {
            Preset::Testing => PeerlinkConfig::testing(),
            Preset::LowMemory => PeerlinkConfig::low_memory(),
            Preset::HighThroughput => PeerlinkConfig::high_throughput(),
        };
        Self::default().with_core(core)
    }

    fn with_core(mut self, core: PeerlinkConfig) -> Self {
        self.pipeline = core.pipeline;
        self.session = core.session;
        self.transfer = core.transfer;
        self
    }

    /// Load configuration with the standard priority order
    pub fn load(overrides: &CliOverrides) -> Result<Self> {
        Self::from_figment(Self::figment(overrides)?)
    }

    /// Every layer in priority order, without extracting
    pub fn figment(overrides: &CliOverrides) -> Result<Figment> {
        let base = overrides
            .preset
            .map(Self::from_preset)
            .unwrap_or_default();

        let mut figment = Figment::from(Serialized::defaults(base));
        match &overrides.config_file {
            Some(path) => {
                if !path.exists() {
                    return Err(CliError::Config(format!(
                        "configuration file {} does not exist",
                        path.display()
                    )));
                }
                figment = figment.merge(Toml::file(path));
            }
            None => figment = figment.merge(Toml::file(DEFAULT_CONFIG_FILE)),
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        Ok(Self::apply_overrides(figment, overrides))
    }

    /// Merge the flag layer on top of `figment`
    pub fn apply_overrides(mut figment: Figment, overrides: &CliOverrides) -> Figment {
        if let Some(service_id) = &overrides.service_id {
            figment = figment.merge(("session.service_id", service_id.as_str()));
        }
        if let Some(local_name) = &overrides.local_name {
            figment = figment.merge(("session.local_name", local_name.as_str()));
        }
        if overrides.verbose {
            figment = figment.merge(("cli.verbose", true));
        }
        figment
    }

    /// Extract and validate
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: CliAppConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific file on top of the defaults only
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Self::default())).merge(Toml::file(path.as_ref())),
        )
    }

    /// The session configuration handed to the runtime
    pub fn peerlink(&self) -> PeerlinkConfig {
        PeerlinkConfig {
            pipeline: self.pipeline.clone(),
            session: self.session.clone(),
            transfer: self.transfer.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.peerlink().validate()?;
        if self.cli.event_timeout_ms == 0 {
            return Err(CliError::Config(
                "cli.event_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Render as TOML, the format of the configuration file
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::BufferPolicy;

    fn layered(toml: &str, overrides: &CliOverrides) -> Result<CliAppConfig> {
        let figment = Figment::from(Serialized::defaults(CliAppConfig::default()))
            .merge(Toml::string(toml));
        CliAppConfig::from_figment(CliAppConfig::apply_overrides(figment, overrides))
    }

    #[test]
    fn test_default_config_validates() {
        let config = CliAppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.peerlink(), PeerlinkConfig::default());
        assert!(!config.cli.verbose);
    }

    #[test]
    fn test_file_layer_overrides_defaults() {
        let config = layered(
            r#"
            [session]
            service_id = "from-file"

            [pipeline.buffer]
            policy = "drop_oldest"
            capacity = 32
            "#,
            &CliOverrides::default(),
        )
        .unwrap();

        assert_eq!(config.session.service_id, "from-file");
        assert_eq!(config.pipeline.buffer, BufferPolicy::DropOldest { capacity: 32 });
        // Untouched keys keep their defaults.
        assert_eq!(
            config.session.local_name,
            SessionConfig::default().local_name
        );
        assert_eq!(config.transfer, TransferConfig::default());
    }

    #[test]
    fn test_flags_override_file() {
        let overrides = CliOverrides {
            service_id: Some("from-flag".to_string()),
            verbose: true,
            ..Default::default()
        };
        let config = layered("[session]\nservice_id = \"from-file\"\n", &overrides).unwrap();
        assert_eq!(config.session.service_id, "from-flag");
        assert!(config.cli.verbose);
    }

    #[test]
    fn test_invalid_layer_is_rejected() {
        let err = layered(
            "[pipeline.buffer]\npolicy = \"drop_oldest\"\ncapacity = 0\n",
            &CliOverrides::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CliError::Peerlink(_)));

        let err = layered("[cli]\nevent_timeout_ms = 0\n", &CliOverrides::default()).unwrap_err();
        assert!(matches!(err, CliError::Config(_)));
    }

    #[test]
    fn test_preset_becomes_base_layer() {
        let config = CliAppConfig::from_preset(Preset::Testing);
        assert_eq!(config.peerlink(), PeerlinkConfig::testing());
        assert_eq!(config.cli, CliConfig::default());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let overrides = CliOverrides {
            config_file: Some(PathBuf::from("/definitely/not/here/peerlink.toml")),
            ..Default::default()
        };
        assert!(matches!(
            CliAppConfig::figment(&overrides),
            Err(CliError::Config(_))
        ));
    }

    #[test]
    fn test_renders_both_formats() {
        let config = CliAppConfig::default();
        let toml = config.to_toml().unwrap();
        assert!(toml.contains("[session]"));
        assert!(toml.contains("[cli]"));

        let json: serde_json::Value = serde_json::from_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(json["session"]["service_id"], config.session.service_id.as_str());
    }
}
