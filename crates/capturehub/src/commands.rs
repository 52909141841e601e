//! Which commands bring a producer from what it last saw to what is true now.

use captureproto::{catch_up, CaptureOptions, CapturePhase, ProducerCommand, Step};

/// A phase as seen by one connection, tagged with the capture it belongs to.
///
/// The generation changes on every fresh start, so two observations of the
/// same phase from different captures compare unequal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedPhase {
    pub phase: CapturePhase,
    pub generation: u64,
}

impl ObservedPhase {
    /// What a connection has "seen" before its first observation.
    pub const INITIAL: ObservedPhase = ObservedPhase {
        phase: CapturePhase::Finished,
        generation: 0,
    };

    /// True if moving from `last` to `self` enters `Started` for a capture
    /// this connection has not been counted in yet.
    pub fn enters_started(&self, last: ObservedPhase) -> bool {
        self.phase == CapturePhase::Started && *self != last
    }
}

/// Ordered commands that replay every transition between `last` and `current`.
///
/// Within one capture this is the plain [`catch_up`] diff. Across captures
/// the old one is finished first and the new one replayed from `Finished`, so
/// a restart that happened entirely between two observations is still seen
/// as `CaptureFinished`, `StartCapture`. A capture that started and finished
/// between two observations produces nothing.
pub fn plan_commands(
    last: ObservedPhase,
    current: ObservedPhase,
    options: Option<&CaptureOptions>,
) -> Vec<ProducerCommand> {
    if last == current {
        return Vec::new();
    }

    let steps: Vec<Step> = if last.generation == current.generation {
        catch_up(last.phase, current.phase).steps.to_vec()
    } else {
        let finish_old = catch_up(last.phase, CapturePhase::Finished);
        let replay_new = catch_up(CapturePhase::Finished, current.phase);
        finish_old
            .steps
            .iter()
            .chain(replay_new.steps)
            .copied()
            .collect()
    };

    steps
        .into_iter()
        .map(|step| match step {
            Step::Start => ProducerCommand::StartCapture {
                options: options.cloned().unwrap_or_default(),
            },
            Step::Stop => ProducerCommand::StopCapture,
            Step::Finish => ProducerCommand::CaptureFinished,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use captureproto::CapturePhase::{Finished, Started, Stopping};

    fn seen(phase: CapturePhase, generation: u64) -> ObservedPhase {
        ObservedPhase { phase, generation }
    }

    fn names(commands: &[ProducerCommand]) -> Vec<&'static str> {
        commands.iter().map(|c| c.name()).collect()
    }

    #[test]
    fn test_same_capture_pairs() {
        let options = CaptureOptions::new(42, 1000.0);
        let cases: [(CapturePhase, CapturePhase, &[&str]); 5] = [
            (Started, Stopping, &["StopCapture"]),
            (Finished, Stopping, &["StartCapture", "StopCapture"]),
            (Stopping, Finished, &["CaptureFinished"]),
            (Started, Finished, &["StopCapture", "CaptureFinished"]),
            (Stopping, Started, &["CaptureFinished", "StartCapture"]),
        ];
        for (last, current, expected) in cases {
            let commands = plan_commands(seen(last, 3), seen(current, 3), Some(&options));
            assert_eq!(names(&commands), expected, "{} -> {}", last, current);
        }
    }

    #[test]
    fn test_fresh_start() {
        let options = CaptureOptions::new(42, 1000.0);
        let commands = plan_commands(ObservedPhase::INITIAL, seen(Started, 1), Some(&options));
        assert_eq!(commands, vec![ProducerCommand::StartCapture { options }]);
    }

    #[test]
    fn test_no_change_is_silent() {
        for phase in [Finished, Started, Stopping] {
            assert!(plan_commands(seen(phase, 2), seen(phase, 2), None).is_empty());
        }
    }

    #[test]
    fn test_restart_between_observations() {
        // Started(1) -> stop -> finish -> Started(2), all missed
        let commands = plan_commands(seen(Started, 1), seen(Started, 2), None);
        assert_eq!(
            names(&commands),
            vec!["StopCapture", "CaptureFinished", "StartCapture"]
        );

        let commands = plan_commands(seen(Stopping, 1), seen(Stopping, 2), None);
        assert_eq!(
            names(&commands),
            vec!["CaptureFinished", "StartCapture", "StopCapture"]
        );
    }

    #[test]
    fn test_whole_capture_missed() {
        assert!(plan_commands(seen(Finished, 1), seen(Finished, 2), None).is_empty());
    }

    #[test]
    fn test_missing_options_fall_back_to_default() {
        let commands = plan_commands(ObservedPhase::INITIAL, seen(Stopping, 1), None);
        assert_eq!(
            commands[0],
            ProducerCommand::StartCapture {
                options: CaptureOptions::default()
            }
        );
    }

    #[test]
    fn test_enters_started() {
        assert!(seen(Started, 1).enters_started(ObservedPhase::INITIAL));
        assert!(seen(Started, 2).enters_started(seen(Started, 1)));
        assert!(seen(Started, 2).enters_started(seen(Stopping, 1)));
        assert!(!seen(Started, 1).enters_started(seen(Started, 1)));
        assert!(!seen(Stopping, 1).enters_started(ObservedPhase::INITIAL));
    }
}
