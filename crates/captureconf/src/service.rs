//! Capture coordination tunables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for the coordination service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Upper bound on how long a stop request waits for every producer to
    /// report AllEventsSent (or disconnect) before the capture is finalized.
    /// Default: 10000
    #[serde(default = "ServiceConfig::default_max_wait_ms")]
    pub max_wait_for_all_events_sent_ms: u64,
}

impl ServiceConfig {
    pub(crate) fn default_max_wait_ms() -> u64 {
        10_000
    }

    pub fn max_wait_for_all_events_sent(&self) -> Duration {
        Duration::from_millis(self.max_wait_for_all_events_sent_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_wait_for_all_events_sent_ms: Self::default_max_wait_ms(),
        }
    }
}

/// Settings used by producer processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Endpoint producers connect to. Empty means "same as bind.endpoint".
    #[serde(default)]
    pub endpoint: String,

    /// Delay before reconnecting after the hub goes away.
    /// Default: 5000
    #[serde(default = "ProducerConfig::default_reconnection_delay_ms")]
    pub reconnection_delay_ms: u64,
}

impl ProducerConfig {
    pub(crate) fn default_reconnection_delay_ms() -> u64 {
        5_000
    }

    pub fn reconnection_delay(&self) -> Duration {
        Duration::from_millis(self.reconnection_delay_ms)
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            reconnection_delay_ms: Self::default_reconnection_delay_ms(),
        }
    }
}
