//! One producer connection: a command loop and an event loop.
//!
//! The command loop runs on its own task and owns the write half; the event
//! loop runs on the connection task and owns the read half. Either side
//! ending cancels the connection, which ends the other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use captureproto::{HubCodec, ProducerCommand, ProducerId, ProducerMessage, WireError};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::commands::{plan_commands, ObservedPhase};
use crate::lifecycle::{CaptureLifecycle, Completion};

/// Per-connection bookkeeping shared by its two loops.
pub struct ConnectionState {
    pub producer_id: ProducerId,
    pub(crate) cancel: CancellationToken,
    /// Generation of the capture this connection still owes a completion
    /// for, 0 if none. Only touched inside the lifecycle's exclusive section.
    owed_generation: AtomicU64,
}

impl ConnectionState {
    pub(crate) fn new(producer_id: ProducerId, cancel: CancellationToken) -> Self {
        Self {
            producer_id,
            cancel,
            owed_generation: AtomicU64::new(0),
        }
    }

    pub(crate) fn owe_completion(&self, generation: u64) {
        self.owed_generation.store(generation, Ordering::Relaxed);
    }

    pub(crate) fn owes_completion_for(&self, generation: u64) -> bool {
        let owed = self.owed_generation.load(Ordering::Relaxed);
        owed != 0 && owed == generation
    }

    pub(crate) fn clear_owed_completion(&self) {
        self.owed_generation.store(0, Ordering::Relaxed);
    }
}

/// Serve one producer until it disconnects, fails, or the service shuts down.
pub async fn serve_connection<S>(lifecycle: Arc<CaptureLifecycle>, stream: S, codec: HubCodec)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let producer_id = lifecycle.next_producer_id();
    let cancel = lifecycle.registry().register(producer_id);
    if lifecycle.is_shutdown_requested() {
        cancel.cancel();
    }
    let conn = Arc::new(ConnectionState::new(producer_id, cancel));

    let span = info_span!("producer", producer_id = %producer_id);
    async move {
        info!("producer connected");
        let (writer, reader) = Framed::new(stream, codec).split();

        let commands = tokio::spawn(
            send_commands(lifecycle.clone(), conn.clone(), writer).in_current_span(),
        );
        receive_events(&lifecycle, &conn, reader).await;

        conn.cancel.cancel();
        if let Err(e) = commands.await {
            warn!("command loop task failed: {}", e);
        }
        lifecycle.registry().deregister(producer_id);
        info!("producer disconnected");
    }
    .instrument(span)
    .await
}

/// Keep the producer's command stream in step with the lifecycle.
async fn send_commands<W>(lifecycle: Arc<CaptureLifecycle>, conn: Arc<ConnectionState>, mut writer: W)
where
    W: Sink<ProducerCommand, Error = WireError> + Unpin,
{
    let mut changes = lifecycle.subscribe();
    let mut last = ObservedPhase::INITIAL;

    loop {
        if lifecycle.is_shutdown_requested() {
            debug!("command loop exiting for shutdown");
            return;
        }

        if let Some(observation) = lifecycle.observe(&conn, last) {
            let commands = plan_commands(last, observation.current, observation.options.as_ref());
            if commands.len() > 1 {
                debug!(
                    "catching up {} -> {} with {} commands",
                    last.phase,
                    observation.current.phase,
                    commands.len()
                );
            }
            for command in commands {
                trace!("sending {}", command.name());
                let sent = tokio::select! {
                    _ = conn.cancel.cancelled() => return,
                    sent = writer.send(command) => sent,
                };
                if let Err(e) = sent {
                    warn!("write failed, dropping connection: {}", e);
                    conn.cancel.cancel();
                    return;
                }
            }
            last = observation.current;
            continue;
        }

        tokio::select! {
            _ = conn.cancel.cancelled() => return,
            changed = changes.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// Read producer messages until the stream ends or the connection is cancelled.
async fn receive_events<R>(lifecycle: &CaptureLifecycle, conn: &ConnectionState, mut reader: R)
where
    R: Stream<Item = Result<ProducerMessage, WireError>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = conn.cancel.cancelled() => {
                debug!("connection cancelled");
                break;
            }
            next = reader.next() => next,
        };

        match next {
            Some(Ok(ProducerMessage::BufferedEvents { events })) => {
                trace!("received {} events", events.len());
                lifecycle.dispatch_events(conn.producer_id, events);
            }
            Some(Ok(ProducerMessage::AllEventsSent)) => {
                debug!("received AllEventsSent");
                lifecycle.report_completion(conn, Completion::AllEventsSent);
            }
            Some(Err(e)) => {
                warn!("unreadable message, dropping connection: {}", e);
                break;
            }
            None => {
                debug!("producer closed the stream");
                break;
            }
        }

        if lifecycle.is_shutdown_requested() {
            break;
        }
    }

    lifecycle.report_completion(conn, Completion::Disconnected);
}
