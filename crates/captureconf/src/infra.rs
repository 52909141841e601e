//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};

/// Where the hub listens for producer connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindConfig {
    /// Producer endpoint, `unix:///path/to.sock` or `tcp://host:port`.
    /// Default: unix:///tmp/capturebus-producers.sock
    #[serde(default = "BindConfig::default_endpoint")]
    pub endpoint: String,

    /// Largest accepted frame in bytes.
    /// Default: 64 MiB
    #[serde(default = "BindConfig::default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl BindConfig {
    pub(crate) fn default_endpoint() -> String {
        "unix:///tmp/capturebus-producers.sock".to_string()
    }

    pub(crate) fn default_max_frame_bytes() -> usize {
        64 * 1024 * 1024
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            endpoint: Self::default_endpoint(),
            max_frame_bytes: Self::default_max_frame_bytes(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// EnvFilter directive (trace, debug, info, warn, error, or a full filter).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    pub(crate) fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}
