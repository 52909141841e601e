//! Capture lifecycle shared by every producer connection.
//!
//! One [`CaptureLifecycle`] lives for the whole service. The orchestrator
//! drives it with [`request_start`](CaptureLifecycle::request_start),
//! [`request_stop`](CaptureLifecycle::request_stop) and
//! [`request_shutdown`](CaptureLifecycle::request_shutdown). Connection loops
//! observe it and report progress back into it.
//!
//! The state sits in a `watch` channel: every mutation happens inside
//! `send_modify`/`send_if_modified` (the exclusive section) and wakes every
//! subscriber, which is how command loops and a blocked stop learn about
//! changes. Nothing holds a borrow of the state across an await.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::Duration;

use captureconf::ServiceConfig;
use captureproto::{CaptureOptions, CapturePhase, ProducerCaptureEvent, ProducerId};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::commands::ObservedPhase;
use crate::connection::ConnectionState;
use crate::registry::ConnectionRegistry;
use crate::sink::EventSink;

/// Shared lifecycle fields. Also what [`CaptureLifecycle::snapshot`] returns.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleState {
    pub phase: CapturePhase,
    /// Set while a capture is active. Cleared on finish and on shutdown.
    pub capture_options: Option<CaptureOptions>,
    /// Producers that observed the start of the current capture and have
    /// not yet reported AllEventsSent or disconnected.
    pub producers_remaining: usize,
    /// Bumped on every fresh start; identifies the current capture.
    pub generation: u64,
    /// Set once, never cleared.
    pub shutdown_requested: bool,
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self {
            phase: CapturePhase::Finished,
            capture_options: None,
            producers_remaining: 0,
            generation: 0,
            shutdown_requested: false,
        }
    }
}

impl LifecycleState {
    fn observed(&self) -> ObservedPhase {
        ObservedPhase {
            phase: self.phase,
            generation: self.generation,
        }
    }

    fn finalize(&mut self) {
        self.phase = CapturePhase::Finished;
        self.capture_options = None;
        self.producers_remaining = 0;
    }
}

/// How a [`CaptureLifecycle::request_stop`] call ended. Informational only:
/// the capture is always finished (or handed to a newer start) afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Every counted producer reported AllEventsSent or disconnected.
    AllEventsSent,
    /// The wait hit the configured bound; the capture was finalized anyway.
    TimedOut,
    /// Shutdown was requested while waiting.
    Shutdown,
    /// A new capture was started while this stop was waiting.
    Superseded,
    /// No capture was running.
    NotRunning,
}

enum StartDecision {
    AfterShutdown,
    AlreadyRunning(u64),
    Started { generation: u64, superseded: Option<u64> },
}

enum CompletionResult {
    Inactive,
    NoCapture,
    NotOwed(u64),
    Counted(usize),
}

/// What a connection learned from one observation.
pub(crate) struct Observation {
    pub current: ObservedPhase,
    pub options: Option<CaptureOptions>,
}

/// Why a connection is reporting completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    AllEventsSent,
    Disconnected,
}

pub struct CaptureLifecycle {
    state: watch::Sender<LifecycleState>,
    sink: RwLock<Option<Arc<dyn EventSink>>>,
    registry: ConnectionRegistry,
    max_wait_ms: AtomicU64,
    next_producer_id: AtomicU64,
    shutdown: CancellationToken,
}

impl CaptureLifecycle {
    pub fn new(config: &ServiceConfig) -> Self {
        let (state, _) = watch::channel(LifecycleState::default());
        Self {
            state,
            sink: RwLock::new(None),
            registry: ConnectionRegistry::new(),
            max_wait_ms: AtomicU64::new(config.max_wait_for_all_events_sent_ms),
            next_producer_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Bound for how long [`request_stop`](Self::request_stop) waits.
    pub fn set_max_wait_for_all_events_sent(&self, max_wait: Duration) {
        let ms = u64::try_from(max_wait.as_millis()).unwrap_or(u64::MAX);
        self.max_wait_ms.store(ms, Ordering::Relaxed);
    }

    pub fn max_wait_for_all_events_sent(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms.load(Ordering::Relaxed))
    }

    /// Start a capture and route its events to `sink`.
    ///
    /// Ignored while a capture is already started and after shutdown.
    /// Starting while a stop is still waiting begins a new capture and the
    /// pending stop returns [`StopOutcome::Superseded`].
    ///
    /// Returns the new capture's generation, or `None` if the request was
    /// ignored and `sink` was dropped.
    pub fn request_start(&self, options: CaptureOptions, sink: Arc<dyn EventSink>) -> Option<u64> {
        let mut installed = self.sink_write();
        let mut decision = StartDecision::AfterShutdown;
        self.state.send_if_modified(|s| {
            if s.shutdown_requested {
                return false;
            }
            if s.phase == CapturePhase::Started {
                decision = StartDecision::AlreadyRunning(s.generation);
                return false;
            }
            let superseded = (s.phase == CapturePhase::Stopping).then_some(s.generation);
            s.generation += 1;
            s.phase = CapturePhase::Started;
            s.capture_options = Some(options);
            s.producers_remaining = 0;
            decision = StartDecision::Started {
                generation: s.generation,
                superseded,
            };
            true
        });

        match decision {
            StartDecision::AfterShutdown => {
                warn!("start requested after shutdown, ignoring");
                None
            }
            StartDecision::AlreadyRunning(generation) => {
                warn!("start requested while capture {} is running, ignoring", generation);
                None
            }
            StartDecision::Started {
                generation,
                superseded,
            } => {
                *installed = Some(sink);
                drop(installed);
                if let Some(old) = superseded {
                    info!("start requested while capture {} is stopping, superseding it", old);
                }
                info!("capture {} started", generation);
                Some(generation)
            }
        }
    }

    /// Stop the running capture and wait for producers to flush.
    ///
    /// Waits until every counted producer has reported AllEventsSent or
    /// disconnected, shutdown is requested, or the configured bound elapses,
    /// then finalizes the capture regardless. Never fails; the outcome says
    /// which of those happened.
    pub async fn request_stop(&self) -> StopOutcome {
        let mut finished_now = None;
        let mut stopping = None;
        {
            let mut installed = self.sink_write();
            self.state.send_if_modified(|s| {
                if s.phase == CapturePhase::Finished {
                    return false;
                }
                s.phase = CapturePhase::Stopping;
                stopping = Some(s.generation);
                if s.shutdown_requested {
                    finished_now = Some(StopOutcome::Shutdown);
                } else if s.producers_remaining == 0 {
                    finished_now = Some(StopOutcome::AllEventsSent);
                }
                if finished_now.is_some() {
                    s.finalize();
                }
                true
            });
            if finished_now.is_some() {
                installed.take();
            }
        }

        let Some(generation) = stopping else {
            debug!("stop requested with no capture running");
            return StopOutcome::NotRunning;
        };
        match finished_now {
            Some(StopOutcome::Shutdown) => {
                info!("capture {} finished by shutdown", generation);
                return StopOutcome::Shutdown;
            }
            Some(outcome) => {
                info!("capture {} finished, no producers outstanding", generation);
                return outcome;
            }
            None => {}
        }

        let max_wait = self.max_wait_for_all_events_sent();
        info!(
            "capture {} stopping, waiting up to {:?} for producers",
            generation, max_wait
        );

        let mut rx = self.state.subscribe();
        let done = |s: &LifecycleState| {
            s.producers_remaining == 0 || s.shutdown_requested || s.generation != generation
        };
        // The borrowed state must be released before finalizing below.
        let outcome = match tokio::time::timeout(max_wait, rx.wait_for(done)).await {
            Ok(Ok(s)) if s.generation != generation => StopOutcome::Superseded,
            Ok(Ok(s)) if s.shutdown_requested => StopOutcome::Shutdown,
            Ok(Ok(_)) => StopOutcome::AllEventsSent,
            Ok(Err(_)) => StopOutcome::Shutdown,
            Err(_) => StopOutcome::TimedOut,
        };

        if outcome == StopOutcome::Superseded {
            info!("capture {} superseded before it finished stopping", generation);
            return outcome;
        }

        let mut remaining = 0;
        {
            let mut installed = self.sink_write();
            let finalized = self.state.send_if_modified(|s| {
                if s.generation != generation || s.phase == CapturePhase::Finished {
                    return false;
                }
                remaining = s.producers_remaining;
                s.finalize();
                true
            });
            if finalized {
                installed.take();
            }
        }

        match outcome {
            StopOutcome::TimedOut => warn!(
                "capture {} finished after {:?} timeout with {} producers still outstanding",
                generation, max_wait, remaining
            ),
            StopOutcome::Shutdown => info!("capture {} finished by shutdown", generation),
            _ => info!("capture {} finished, all events sent", generation),
        }
        outcome
    }

    /// Wake every waiter, drop the capture, and cancel every connection.
    pub fn request_shutdown(&self) {
        {
            let mut installed = self.sink_write();
            let first = self.state.send_if_modified(|s| {
                if s.shutdown_requested {
                    return false;
                }
                s.shutdown_requested = true;
                s.capture_options = None;
                true
            });
            installed.take();
            if first {
                info!("shutdown requested");
            }
        }
        self.shutdown.cancel();
        self.registry.cancel_all();
    }

    pub fn snapshot(&self) -> LifecycleState {
        self.state.borrow().clone()
    }

    pub fn phase(&self) -> CapturePhase {
        self.state.borrow().phase
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.state.borrow().shutdown_requested
    }

    /// Number of live producer connections.
    pub fn connected_producers(&self) -> usize {
        self.registry.len()
    }

    /// Cancelled once shutdown is requested.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Receiver that wakes on every lifecycle mutation.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub(crate) fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub(crate) fn next_producer_id(&self) -> ProducerId {
        ProducerId(self.next_producer_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Read the current phase for a connection that last saw `last`.
    ///
    /// Returns `None` when nothing changed. Entering `Started` for a new
    /// capture counts the connection in `producers_remaining`; the count and
    /// the observation happen in the same exclusive section, so each start
    /// is counted once per connection.
    pub(crate) fn observe(
        &self,
        conn: &ConnectionState,
        last: ObservedPhase,
    ) -> Option<Observation> {
        let mut observation = None;
        self.state.send_if_modified(|s| {
            let current = s.observed();
            if current == last || s.shutdown_requested {
                return false;
            }

            let mut modified = false;
            if current.enters_started(last) {
                s.producers_remaining += 1;
                conn.owe_completion(current.generation);
                modified = true;
            } else if !conn.owes_completion_for(current.generation) {
                conn.clear_owed_completion();
            }

            observation = Some(Observation {
                current,
                options: s.capture_options.clone(),
            });
            modified
        });
        observation
    }

    /// Count a producer's completion at most once per capture.
    pub(crate) fn report_completion(&self, conn: &ConnectionState, completion: Completion) {
        let producer_id = conn.producer_id;
        let mut result = CompletionResult::Inactive;
        let mut early = false;
        self.state.send_if_modified(|s| {
            if completion == Completion::AllEventsSent {
                match s.phase {
                    CapturePhase::Finished => {
                        result = CompletionResult::NoCapture;
                        return false;
                    }
                    CapturePhase::Started => early = true,
                    CapturePhase::Stopping => {}
                }
            } else if !s.phase.is_active() {
                return false;
            }

            if !conn.owes_completion_for(s.generation) {
                result = CompletionResult::NotOwed(s.generation);
                return false;
            }

            conn.clear_owed_completion();
            s.producers_remaining = s.producers_remaining.saturating_sub(1);
            result = CompletionResult::Counted(s.producers_remaining);
            true
        });

        let all_events_sent = completion == Completion::AllEventsSent;
        if early {
            warn!(%producer_id, "AllEventsSent before StopCapture");
        }
        match result {
            CompletionResult::NoCapture => {
                warn!(%producer_id, "AllEventsSent with no capture running, ignoring")
            }
            CompletionResult::NotOwed(generation) if all_events_sent => warn!(
                %producer_id,
                "AllEventsSent for capture {} already counted or never owed",
                generation
            ),
            CompletionResult::Counted(remaining) => debug!(
                %producer_id,
                "completion ({:?}) counted, {} producers remaining",
                completion,
                remaining
            ),
            _ => {}
        }
    }

    /// Hand a batch to the installed sink, in order.
    ///
    /// The sink lock is held for the whole batch, so once a stop has removed
    /// the sink no further events reach it.
    pub(crate) fn dispatch_events(&self, producer_id: ProducerId, events: Vec<ProducerCaptureEvent>) {
        let installed = self.sink.read().unwrap_or_else(PoisonError::into_inner);
        match installed.as_ref() {
            Some(sink) => {
                for event in events {
                    sink.process(producer_id, event);
                }
            }
            None => trace!(%producer_id, "no capture running, dropping {} events", events.len()),
        }
    }

    fn sink_write(&self) -> RwLockWriteGuard<'_, Option<Arc<dyn EventSink>>> {
        self.sink.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CountingSink;
    use std::time::Instant;

    fn lifecycle(max_wait_ms: u64) -> CaptureLifecycle {
        CaptureLifecycle::new(&ServiceConfig {
            max_wait_for_all_events_sent_ms: max_wait_ms,
        })
    }

    fn connection(lifecycle: &CaptureLifecycle) -> ConnectionState {
        let producer_id = lifecycle.next_producer_id();
        let cancel = lifecycle.registry().register(producer_id);
        ConnectionState::new(producer_id, cancel)
    }

    fn assert_invariants(state: &LifecycleState) {
        if !state.shutdown_requested {
            assert_eq!(
                state.capture_options.is_some(),
                state.phase != CapturePhase::Finished,
                "options present iff capture active: {:?}",
                state
            );
        }
        if state.phase == CapturePhase::Finished {
            assert_eq!(state.producers_remaining, 0);
        }
    }

    #[tokio::test]
    async fn test_stop_with_no_producers_is_immediate() {
        let lifecycle = lifecycle(10_000);
        lifecycle.request_start(CaptureOptions::new(1, 100.0), Arc::new(CountingSink::new()));
        assert_invariants(&lifecycle.snapshot());

        let started = Instant::now();
        assert_eq!(lifecycle.request_stop().await, StopOutcome::AllEventsSent);
        assert!(started.elapsed() < Duration::from_secs(1));

        let state = lifecycle.snapshot();
        assert_eq!(state.phase, CapturePhase::Finished);
        assert_invariants(&state);
    }

    #[tokio::test]
    async fn test_double_start_counts_once() {
        let lifecycle = lifecycle(10_000);
        let conn = connection(&lifecycle);
        let generation =
            lifecycle.request_start(CaptureOptions::new(1, 100.0), Arc::new(CountingSink::new()));
        assert_eq!(generation, Some(1));
        let first = lifecycle.observe(&conn, ObservedPhase::INITIAL).unwrap();

        let ignored =
            lifecycle.request_start(CaptureOptions::new(2, 200.0), Arc::new(CountingSink::new()));
        assert_eq!(ignored, None);
        assert!(lifecycle.observe(&conn, first.current).is_none());

        let state = lifecycle.snapshot();
        assert_eq!(state.producers_remaining, 1);
        assert_eq!(state.capture_options, Some(CaptureOptions::new(1, 100.0)));
    }

    #[tokio::test]
    async fn test_double_stop_is_a_noop() {
        let lifecycle = lifecycle(10_000);
        lifecycle.request_start(CaptureOptions::default(), Arc::new(CountingSink::new()));
        assert_eq!(lifecycle.request_stop().await, StopOutcome::AllEventsSent);
        let generation = lifecycle.snapshot().generation;

        assert_eq!(lifecycle.request_stop().await, StopOutcome::NotRunning);
        let state = lifecycle.snapshot();
        assert_eq!(state.phase, CapturePhase::Finished);
        assert_eq!(state.generation, generation);
    }

    #[tokio::test]
    async fn test_completion_counted_once() {
        let lifecycle = lifecycle(10_000);
        let conn = connection(&lifecycle);
        lifecycle.request_start(CaptureOptions::default(), Arc::new(CountingSink::new()));
        lifecycle.observe(&conn, ObservedPhase::INITIAL).unwrap();
        assert_eq!(lifecycle.snapshot().producers_remaining, 1);

        lifecycle.report_completion(&conn, Completion::AllEventsSent);
        lifecycle.report_completion(&conn, Completion::AllEventsSent);
        lifecycle.report_completion(&conn, Completion::Disconnected);
        assert_eq!(lifecycle.snapshot().producers_remaining, 0);
    }

    #[tokio::test]
    async fn test_late_joiner_during_stop_is_not_counted() {
        let lifecycle = Arc::new(lifecycle(10_000));
        let early = connection(&lifecycle);
        lifecycle.request_start(CaptureOptions::default(), Arc::new(CountingSink::new()));
        lifecycle.observe(&early, ObservedPhase::INITIAL).unwrap();

        let stopper = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.request_stop().await })
        };
        let mut rx = lifecycle.subscribe();
        rx.wait_for(|s| s.phase == CapturePhase::Stopping).await.unwrap();

        let late = connection(&lifecycle);
        let seen = lifecycle.observe(&late, ObservedPhase::INITIAL).unwrap();
        assert_eq!(seen.current.phase, CapturePhase::Stopping);
        assert_eq!(lifecycle.snapshot().producers_remaining, 1);

        lifecycle.report_completion(&late, Completion::Disconnected);
        assert_eq!(lifecycle.snapshot().producers_remaining, 1);

        lifecycle.report_completion(&early, Completion::AllEventsSent);
        assert_eq!(stopper.await.unwrap(), StopOutcome::AllEventsSent);
    }

    #[tokio::test]
    async fn test_stop_times_out_and_finalizes() {
        let lifecycle = lifecycle(100);
        let conn = connection(&lifecycle);
        lifecycle.request_start(CaptureOptions::default(), Arc::new(CountingSink::new()));
        lifecycle.observe(&conn, ObservedPhase::INITIAL).unwrap();

        let started = Instant::now();
        assert_eq!(lifecycle.request_stop().await, StopOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(100));

        let state = lifecycle.snapshot();
        assert_eq!(state.phase, CapturePhase::Finished);
        assert_eq!(state.producers_remaining, 0);
        assert_invariants(&state);

        // the stale debt from the timed-out capture is never counted
        lifecycle.report_completion(&conn, Completion::Disconnected);
        assert_eq!(lifecycle.snapshot().producers_remaining, 0);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_stop() {
        let lifecycle = Arc::new(lifecycle(60_000));
        let conn = connection(&lifecycle);
        lifecycle.request_start(CaptureOptions::default(), Arc::new(CountingSink::new()));
        lifecycle.observe(&conn, ObservedPhase::INITIAL).unwrap();

        let stopper = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.request_stop().await })
        };
        let mut rx = lifecycle.subscribe();
        rx.wait_for(|s| s.phase == CapturePhase::Stopping).await.unwrap();

        lifecycle.request_shutdown();
        let outcome = tokio::time::timeout(Duration::from_secs(5), stopper)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, StopOutcome::Shutdown);
        assert!(conn.cancel.is_cancelled());
        assert!(lifecycle.shutdown_token().is_cancelled());

        let state = lifecycle.snapshot();
        assert!(state.shutdown_requested);
        assert_eq!(state.capture_options, None);
    }

    #[tokio::test]
    async fn test_restart_during_stop_supersedes() {
        let lifecycle = Arc::new(lifecycle(60_000));
        let conn = connection(&lifecycle);
        lifecycle.request_start(CaptureOptions::new(1, 1.0), Arc::new(CountingSink::new()));
        let first = lifecycle.observe(&conn, ObservedPhase::INITIAL).unwrap();

        let stopper = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.request_stop().await })
        };
        let mut rx = lifecycle.subscribe();
        rx.wait_for(|s| s.phase == CapturePhase::Stopping).await.unwrap();

        lifecycle.request_start(CaptureOptions::new(2, 2.0), Arc::new(CountingSink::new()));
        assert_eq!(stopper.await.unwrap(), StopOutcome::Superseded);

        let state = lifecycle.snapshot();
        assert_eq!(state.phase, CapturePhase::Started);
        assert_eq!(state.generation, first.current.generation + 1);
        assert_eq!(state.producers_remaining, 0);

        // the connection is counted again for the new capture
        let second = lifecycle.observe(&conn, first.current).unwrap();
        assert_eq!(second.options, Some(CaptureOptions::new(2, 2.0)));
        assert_eq!(lifecycle.snapshot().producers_remaining, 1);
    }

    #[tokio::test]
    async fn test_start_after_shutdown_ignored() {
        let lifecycle = lifecycle(10_000);
        lifecycle.request_shutdown();
        let started = lifecycle.request_start(CaptureOptions::default(), Arc::new(CountingSink::new()));
        assert_eq!(started, None);
        assert_eq!(lifecycle.phase(), CapturePhase::Finished);
    }

    #[tokio::test]
    async fn test_stop_after_shutdown_reports_shutdown() {
        let lifecycle = lifecycle(60_000);
        let conn = connection(&lifecycle);
        lifecycle.request_start(CaptureOptions::default(), Arc::new(CountingSink::new()));
        lifecycle.observe(&conn, ObservedPhase::INITIAL).unwrap();
        lifecycle.request_shutdown();

        let state = lifecycle.snapshot();
        assert_eq!(state.phase, CapturePhase::Started);
        assert_eq!(state.producers_remaining, 1);

        let started = Instant::now();
        assert_eq!(lifecycle.request_stop().await, StopOutcome::Shutdown);
        assert!(started.elapsed() < Duration::from_secs(1));

        let state = lifecycle.snapshot();
        assert_eq!(state.phase, CapturePhase::Finished);
        assert_eq!(state.producers_remaining, 0);
    }

    #[tokio::test]
    async fn test_events_dropped_without_sink() {
        let lifecycle = lifecycle(10_000);
        let sink = Arc::new(CountingSink::new());
        lifecycle.dispatch_events(ProducerId(1), vec![ProducerCaptureEvent::new(b"a".to_vec())]);

        lifecycle.request_start(CaptureOptions::default(), sink.clone());
        lifecycle.dispatch_events(ProducerId(1), vec![ProducerCaptureEvent::new(b"b".to_vec())]);
        lifecycle.request_stop().await;
        lifecycle.dispatch_events(ProducerId(1), vec![ProducerCaptureEvent::new(b"c".to_vec())]);

        assert_eq!(sink.total_events(), 1);
    }
}
