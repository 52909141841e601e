//! Messages exchanged on a producer connection.
//!
//! The hub sends [`ProducerCommand`]s, the producer sends
//! [`ProducerMessage`]s. Both travel as length-delimited frames; see
//! [`crate::wire`] for the payload encoding.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::phase::{CapturePhase, Step};

/// Identifier the hub assigns to each producer connection.
///
/// Every event handed to the capture pipeline is attributed to one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProducerId(pub u64);

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "producer-{}", self.0)
    }
}

/// Configuration for one capture, forwarded verbatim to every producer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureOptions {
    /// Process being profiled.
    pub pid: u32,
    /// Sampling frequency requested from samplers, 0 disables sampling.
    pub samples_per_second: f64,
    /// Producer-specific knobs the hub does not interpret.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl CaptureOptions {
    pub fn new(pid: u32, samples_per_second: f64) -> Self {
        Self {
            pid,
            samples_per_second,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// An opaque, already-serialized telemetry record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerCaptureEvent {
    /// Producer clock at emission, if the producer tracks one.
    #[serde(default)]
    pub timestamp_ns: Option<u64>,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl ProducerCaptureEvent {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp_ns: None,
            payload: payload.into(),
        }
    }

    pub fn with_timestamp(mut self, timestamp_ns: u64) -> Self {
        self.timestamp_ns = Some(timestamp_ns);
        self
    }
}

/// Hub -> producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerCommand {
    StartCapture { options: CaptureOptions },
    StopCapture,
    CaptureFinished,
}

impl ProducerCommand {
    /// Phase the producer is in after obeying this command.
    pub fn target(&self) -> CapturePhase {
        self.step().target()
    }

    pub fn step(&self) -> Step {
        match self {
            ProducerCommand::StartCapture { .. } => Step::Start,
            ProducerCommand::StopCapture => Step::Stop,
            ProducerCommand::CaptureFinished => Step::Finish,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProducerCommand::StartCapture { .. } => "StartCapture",
            ProducerCommand::StopCapture => "StopCapture",
            ProducerCommand::CaptureFinished => "CaptureFinished",
        }
    }
}

/// Producer -> hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerMessage {
    /// Zero or more events, delivered to the pipeline in order.
    BufferedEvents { events: Vec<ProducerCaptureEvent> },
    /// The producer has flushed everything it had for the current capture.
    AllEventsSent,
}

impl ProducerMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ProducerMessage::BufferedEvents { .. } => "BufferedEvents",
            ProducerMessage::AllEventsSent => "AllEventsSent",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_targets() {
        let start = ProducerCommand::StartCapture {
            options: CaptureOptions::new(42, 1234.0),
        };
        assert_eq!(start.target(), CapturePhase::Started);
        assert_eq!(ProducerCommand::StopCapture.target(), CapturePhase::Stopping);
        assert_eq!(ProducerCommand::CaptureFinished.target(), CapturePhase::Finished);
        assert_eq!(start.name(), "StartCapture");
    }

    #[test]
    fn test_producer_id_display() {
        assert_eq!(ProducerId(7).to_string(), "producer-7");
    }

    #[test]
    fn test_options_builder() {
        let options = CaptureOptions::new(1, 0.0).with_extra("unwinding", "frame_pointers");
        assert_eq!(options.extra.get("unwinding").map(String::as_str), Some("frame_pointers"));
    }
}
