//! Capture phases and the catch-up diff between them.
//!
//! Both ends of a producer connection track a [`CapturePhase`]. Either end may
//! observe a later phase without having seen the ones in between (the hub
//! only sees the latest state, the producer must tolerate duplicates).
//! [`catch_up`] turns "what I saw last" and "what is true now" into the
//! ordered steps that replay the missing transitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phase of the current (or most recent) capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapturePhase {
    /// No capture running. Initial phase, and the phase after every stop.
    #[default]
    Finished,
    /// Producers should be emitting events.
    Started,
    /// Producers should flush and report AllEventsSent.
    Stopping,
}

impl CapturePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapturePhase::Finished => "finished",
            CapturePhase::Started => "started",
            CapturePhase::Stopping => "stopping",
        }
    }

    /// True while a capture owns the producers (started or stopping).
    pub fn is_active(&self) -> bool {
        !matches!(self, CapturePhase::Finished)
    }
}

impl fmt::Display for CapturePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transition step, in the order a producer must see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Start,
    Stop,
    Finish,
}

impl Step {
    /// Phase reached after applying this step.
    pub fn target(self) -> CapturePhase {
        match self {
            Step::Start => CapturePhase::Started,
            Step::Stop => CapturePhase::Stopping,
            Step::Finish => CapturePhase::Finished,
        }
    }
}

/// Result of diffing two phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUp {
    /// Steps to replay, oldest first. Empty when nothing changed.
    pub steps: &'static [Step],
}

/// Diff `last` against `current`.
///
/// The cycle is `Finished -> Started -> Stopping -> Finished`, so any pair of
/// phases has exactly one shortest forward path between them.
pub fn catch_up(last: CapturePhase, current: CapturePhase) -> CatchUp {
    use CapturePhase::*;
    use Step::*;

    let steps: &'static [Step] = match (last, current) {
        (Finished, Started) => &[Start],
        (Stopping, Started) => &[Finish, Start],
        (Started, Stopping) => &[Stop],
        (Finished, Stopping) => &[Start, Stop],
        (Stopping, Finished) => &[Finish],
        (Started, Finished) => &[Stop, Finish],
        (Finished, Finished) | (Started, Started) | (Stopping, Stopping) => &[],
    };

    CatchUp { steps }
}
