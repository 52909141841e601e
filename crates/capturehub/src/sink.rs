//! Where decoded producer events go.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use captureproto::{ProducerCaptureEvent, ProducerId};
use tokio::sync::mpsc;
use tracing::info;

/// Consumer of capture events, installed by `request_start` and removed when
/// the capture finishes.
///
/// Called synchronously from the event loop of the connection that received
/// the event, so events from one producer arrive in order. Implementations
/// must not block for long: the connection reads nothing else meanwhile.
pub trait EventSink: Send + Sync {
    fn process(&self, producer_id: ProducerId, event: ProducerCaptureEvent);
}

impl<F> EventSink for F
where
    F: Fn(ProducerId, ProducerCaptureEvent) + Send + Sync,
{
    fn process(&self, producer_id: ProducerId, event: ProducerCaptureEvent) {
        self(producer_id, event)
    }
}

/// Forwards events into an unbounded channel for an async pipeline.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<(ProducerId, ProducerCaptureEvent)>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(ProducerId, ProducerCaptureEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn process(&self, producer_id: ProducerId, event: ProducerCaptureEvent) {
        // Receiver gone means the pipeline stopped listening; nothing to do.
        let _ = self.tx.send((producer_id, event));
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventTally {
    pub events: u64,
    pub bytes: u64,
}

/// Counts events and payload bytes per producer.
#[derive(Default)]
pub struct CountingSink {
    tallies: Mutex<BTreeMap<ProducerId, EventTally>>,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn totals(&self) -> BTreeMap<ProducerId, EventTally> {
        self.tallies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn total_events(&self) -> u64 {
        self.totals().values().map(|t| t.events).sum()
    }

    pub fn log_totals(&self) {
        let totals = self.totals();
        if totals.is_empty() {
            info!("capture finished with no events");
            return;
        }
        for (producer_id, tally) in &totals {
            info!(
                producer_id = %producer_id,
                events = tally.events,
                bytes = tally.bytes,
                "capture totals"
            );
        }
    }
}

impl EventSink for CountingSink {
    fn process(&self, producer_id: ProducerId, event: ProducerCaptureEvent) {
        let mut tallies = self.tallies.lock().unwrap_or_else(PoisonError::into_inner);
        let tally = tallies.entry(producer_id).or_default();
        tally.events += 1;
        tally.bytes += event.payload.len() as u64;
    }
}
