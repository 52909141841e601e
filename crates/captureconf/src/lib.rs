//! Minimal configuration loading for capturebus.
//!
//! Both the hub daemon and producer processes import this crate, so it stays
//! light: serde, toml and directories only.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/capturebus/config.toml` (system)
//! 2. `~/.config/capturebus/config.toml` (user)
//! 3. `./capturebus.toml` (local override, or an explicit path)
//! 4. Environment variables (`CAPTUREBUS_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [bind]
//! endpoint = "unix:///run/capturebus/producers.sock"
//!
//! [service]
//! max_wait_for_all_events_sent_ms = 10000
//!
//! [producer]
//! reconnection_delay_ms = 5000
//!
//! [telemetry]
//! log_level = "info"
//! ```

pub mod infra;
pub mod loader;
pub mod service;

pub use infra::{BindConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};
pub use service::{ProducerConfig, ServiceConfig};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete capturebus configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CaptureConfig {
    #[serde(default)]
    pub bind: BindConfig,

    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub producer: ProducerConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl CaptureConfig {
    /// Load configuration with `config_path` replacing the local override.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = CaptureConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            loader::load_from_file(&mut config, &path)?;
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Endpoint producers should connect to.
    pub fn producer_endpoint(&self) -> &str {
        if self.producer.endpoint.is_empty() {
            &self.bind.endpoint
        } else {
            &self.producer.endpoint
        }
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# capturebus configuration\n\n");

        output.push_str("[bind]\n");
        output.push_str(&format!("endpoint = \"{}\"\n", self.bind.endpoint));
        output.push_str(&format!("max_frame_bytes = {}\n", self.bind.max_frame_bytes));

        output.push_str("\n[service]\n");
        output.push_str(&format!(
            "max_wait_for_all_events_sent_ms = {}\n",
            self.service.max_wait_for_all_events_sent_ms
        ));

        output.push_str("\n[producer]\n");
        output.push_str(&format!("endpoint = \"{}\"\n", self.producer.endpoint));
        output.push_str(&format!(
            "reconnection_delay_ms = {}\n",
            self.producer.reconnection_delay_ms
        ));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!("log_level = \"{}\"\n", self.telemetry.log_level));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CaptureConfig::default();
        assert_eq!(config.service.max_wait_for_all_events_sent_ms, 10_000);
        assert!(config.bind.endpoint.starts_with("unix://"));
        assert_eq!(config.producer_endpoint(), config.bind.endpoint);
    }

    #[test]
    fn test_producer_endpoint_override() {
        let mut config = CaptureConfig::default();
        config.producer.endpoint = "tcp://10.0.0.2:7600".to_string();
        assert_eq!(config.producer_endpoint(), "tcp://10.0.0.2:7600");
    }

    #[test]
    fn test_to_toml_roundtrips_through_loader() {
        let mut config = CaptureConfig::default();
        config.service.max_wait_for_all_events_sent_ms = 1234;
        config.telemetry.log_level = "debug".to_string();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capturebus.toml");
        std::fs::write(&path, config.to_toml()).unwrap();

        let mut reloaded = CaptureConfig::default();
        loader::load_from_file(&mut reloaded, &path).unwrap();
        assert_eq!(reloaded, config);
    }
}
