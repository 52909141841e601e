//! Client side of the producer protocol.
//!
//! Architecture: reactor pattern, same as the rest of our clients.
//! - The connection is owned by a dedicated reactor task
//! - Outbound messages flow through an mpsc channel, acks come back on oneshots
//! - Handler callbacks run on their own task, so a handler may send
//!   `AllEventsSent` from inside `on_capture_stop` without deadlocking the reactor
//!
//! The producer tracks its own capture phase. Commands are applied with the
//! same [`catch_up`] diff the hub uses, so duplicated commands are ignored and
//! skipped ones are synthesized. Losing the hub mid-capture synthesizes the
//! missing stop and finish callbacks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::{ProducerCodec, DEFAULT_MAX_FRAME_BYTES};
use crate::endpoint::{Endpoint, EndpointError, PeerStream};
use crate::messages::{CaptureOptions, ProducerCaptureEvent, ProducerCommand, ProducerMessage};
use crate::phase::{catch_up, CapturePhase, Step};
use crate::wire::WireError;

/// Callbacks a producer implements to follow the capture lifecycle.
#[async_trait]
pub trait ProducerHandler: Send + Sync + 'static {
    async fn on_capture_start(&self, options: CaptureOptions);
    async fn on_capture_stop(&self);
    async fn on_capture_finished(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("not connected to the capture service")]
    NotConnected,
    #[error("producer client is shut down")]
    Shutdown,
    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, Clone)]
pub struct ProducerClientConfig {
    pub reconnection_delay: Duration,
    pub max_frame_bytes: usize,
}

impl Default for ProducerClientConfig {
    fn default() -> Self {
        Self {
            reconnection_delay: Duration::from_secs(5),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl From<&captureconf::CaptureConfig> for ProducerClientConfig {
    fn from(config: &captureconf::CaptureConfig) -> Self {
        Self {
            reconnection_delay: config.producer.reconnection_delay(),
            max_frame_bytes: config.bind.max_frame_bytes,
        }
    }
}

/// Message waiting for the reactor to write it
struct Outbound {
    message: ProducerMessage,
    ack: oneshot::Sender<Result<(), ProducerError>>,
}

impl Outbound {
    fn reject(self, error: ProducerError) {
        let _ = self.ack.send(Err(error));
    }
}

enum HandlerCall {
    Start(CaptureOptions),
    Stop,
    Finish,
}

struct Shared {
    name: String,
    phase: Mutex<CapturePhase>,
    connected: AtomicBool,
    reconnection_delay_ms: AtomicU64,
}

impl Shared {
    fn phase(&self) -> CapturePhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move the local phase to `target`, queueing one callback per step.
    fn apply(
        &self,
        target: CapturePhase,
        mut options: Option<CaptureOptions>,
        handler_tx: &mpsc::UnboundedSender<HandlerCall>,
    ) {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        let diff = catch_up(*phase, target);
        if diff.steps.is_empty() {
            debug!("{}: already {}, ignoring", self.name, target);
            return;
        }
        if diff.steps.len() > 1 {
            debug!(
                "{}: catching up {} -> {} in {} steps",
                self.name,
                *phase,
                target,
                diff.steps.len()
            );
        }
        for step in diff.steps {
            let call = match step {
                Step::Start => HandlerCall::Start(options.take().unwrap_or_default()),
                Step::Stop => HandlerCall::Stop,
                Step::Finish => HandlerCall::Finish,
            };
            let _ = handler_tx.send(call);
        }
        *phase = target;
    }

    fn reconnection_delay(&self) -> Duration {
        Duration::from_millis(self.reconnection_delay_ms.load(Ordering::Relaxed))
    }
}

/// Cloneable handle for sending events to the hub.
#[derive(Clone)]
pub struct ProducerSender {
    shared: Arc<Shared>,
    outbound_tx: mpsc::Sender<Outbound>,
}

impl ProducerSender {
    /// Send a batch of events. Fails with [`ProducerError::NotConnected`] when
    /// the hub is unreachable; events are not buffered across reconnects.
    pub async fn send_capture_events(
        &self,
        events: Vec<ProducerCaptureEvent>,
    ) -> Result<(), ProducerError> {
        self.send(ProducerMessage::BufferedEvents { events }).await
    }

    /// Tell the hub this producer has flushed everything for the current capture.
    pub async fn notify_all_events_sent(&self) -> Result<(), ProducerError> {
        self.send(ProducerMessage::AllEventsSent).await
    }

    async fn send(&self, message: ProducerMessage) -> Result<(), ProducerError> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(ProducerError::NotConnected);
        }
        let (ack, ack_rx) = oneshot::channel();
        self.outbound_tx
            .send(Outbound { message, ack })
            .await
            .map_err(|_| ProducerError::Shutdown)?;
        ack_rx.await.map_err(|_| ProducerError::Shutdown)?
    }
}

/// Connection from a producer process to the capture service.
///
/// ```ignore
/// let producer = CaptureEventProducer::start("my-sampler", endpoint, handler, config);
/// producer.send_capture_events(events).await?;
/// producer.shutdown_and_wait().await;
/// ```
pub struct CaptureEventProducer {
    sender: ProducerSender,
    shutdown: CancellationToken,
    reactor: JoinHandle<()>,
    handler_task: JoinHandle<()>,
}

impl CaptureEventProducer {
    /// Spawn the reactor. Connecting happens in the background; the hub does
    /// not need to be up yet.
    pub fn start(
        name: impl Into<String>,
        endpoint: Endpoint,
        handler: Arc<dyn ProducerHandler>,
        config: ProducerClientConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            name: name.into(),
            phase: Mutex::new(CapturePhase::Finished),
            connected: AtomicBool::new(false),
            reconnection_delay_ms: AtomicU64::new(
                u64::try_from(config.reconnection_delay.as_millis()).unwrap_or(u64::MAX),
            ),
        });
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let (handler_tx, handler_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let handler_task = tokio::spawn(handler_task(handler, handler_rx));
        let reactor = tokio::spawn(reactor_task(
            endpoint,
            config.max_frame_bytes,
            shared.clone(),
            outbound_rx,
            handler_tx,
            shutdown.clone(),
        ));

        Self {
            sender: ProducerSender {
                shared,
                outbound_tx,
            },
            shutdown,
            reactor,
            handler_task,
        }
    }

    /// Start a producer for the endpoint and timing in a loaded config.
    pub fn from_config(
        name: impl Into<String>,
        config: &captureconf::CaptureConfig,
        handler: Arc<dyn ProducerHandler>,
    ) -> Result<Self, EndpointError> {
        let endpoint: Endpoint = config.producer_endpoint().parse()?;
        Ok(Self::start(name, endpoint, handler, ProducerClientConfig::from(config)))
    }

    pub fn sender(&self) -> ProducerSender {
        self.sender.clone()
    }

    pub async fn send_capture_events(
        &self,
        events: Vec<ProducerCaptureEvent>,
    ) -> Result<(), ProducerError> {
        self.sender.send_capture_events(events).await
    }

    pub async fn notify_all_events_sent(&self) -> Result<(), ProducerError> {
        self.sender.notify_all_events_sent().await
    }

    /// True while the last applied command left this producer in `Started`.
    pub fn is_capturing(&self) -> bool {
        self.sender.shared.phase() == CapturePhase::Started
    }

    pub fn is_connected(&self) -> bool {
        self.sender.shared.connected.load(Ordering::Acquire)
    }

    /// Applies from the next reconnect attempt on.
    pub fn set_reconnection_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.sender
            .shared
            .reconnection_delay_ms
            .store(ms, Ordering::Relaxed);
    }

    /// Stop reconnecting, close the connection, and wait until every pending
    /// handler callback has run.
    pub async fn shutdown_and_wait(self) {
        self.shutdown.cancel();
        if let Err(e) = self.reactor.await {
            warn!("{}: reactor task failed: {}", self.sender.shared.name, e);
        }
        if let Err(e) = self.handler_task.await {
            warn!("{}: handler task failed: {}", self.sender.shared.name, e);
        }
    }
}

async fn handler_task(
    handler: Arc<dyn ProducerHandler>,
    mut calls: mpsc::UnboundedReceiver<HandlerCall>,
) {
    while let Some(call) = calls.recv().await {
        match call {
            HandlerCall::Start(options) => handler.on_capture_start(options).await,
            HandlerCall::Stop => handler.on_capture_stop().await,
            HandlerCall::Finish => handler.on_capture_finished().await,
        }
    }
}

async fn reactor_task(
    endpoint: Endpoint,
    max_frame_bytes: usize,
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    handler_tx: mpsc::UnboundedSender<HandlerCall>,
    shutdown: CancellationToken,
) {
    let name = shared.name.clone();

    'reconnect: loop {
        let connected = tokio::select! {
            _ = shutdown.cancelled() => break 'reconnect,
            result = endpoint.connect() => result,
        };

        match connected {
            Ok(stream) => {
                info!("{}: connected to {}", name, endpoint);
                let framed = Framed::new(stream, ProducerCodec::with_max_frame_bytes(max_frame_bytes));
                let ended = run_session(framed, &shared, &mut outbound_rx, &handler_tx, &shutdown).await;
                shared.connected.store(false, Ordering::Release);
                shared.apply(CapturePhase::Finished, None, &handler_tx);
                if ended == SessionEnd::Abandoned {
                    break 'reconnect;
                }
            }
            Err(e) => {
                debug!("{}: connect to {} failed: {}", name, endpoint, e);
            }
        }

        let delay = shared.reconnection_delay();
        let reconnect_at = tokio::time::sleep(delay);
        tokio::pin!(reconnect_at);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break 'reconnect,
                _ = &mut reconnect_at => break,
                outbound = outbound_rx.recv() => match outbound {
                    Some(outbound) => outbound.reject(ProducerError::NotConnected),
                    None => break 'reconnect,
                },
            }
        }
        trace!("{}: reconnecting to {}", name, endpoint);
    }

    outbound_rx.close();
    while let Some(outbound) = outbound_rx.recv().await {
        outbound.reject(ProducerError::Shutdown);
    }
    debug!("{}: reactor task exiting", name);
}

#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// Connection lost or closed for shutdown.
    Disconnected,
    /// Every handle to the producer was dropped.
    Abandoned,
}

async fn run_session(
    mut framed: Framed<PeerStream, ProducerCodec>,
    shared: &Shared,
    outbound_rx: &mut mpsc::Receiver<Outbound>,
    handler_tx: &mpsc::UnboundedSender<HandlerCall>,
    shutdown: &CancellationToken,
) -> SessionEnd {
    let name = &shared.name;
    shared.connected.store(true, Ordering::Release);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("{}: closing connection for shutdown", name);
                return SessionEnd::Disconnected;
            }
            incoming = framed.next() => match incoming {
                Some(Ok(command)) => {
                    trace!("{}: received {}", name, command.name());
                    let target = command.target();
                    let options = match command {
                        ProducerCommand::StartCapture { options } => Some(options),
                        _ => None,
                    };
                    shared.apply(target, options, handler_tx);
                }
                Some(Err(e)) => {
                    warn!("{}: dropping connection after bad frame: {}", name, e);
                    return SessionEnd::Disconnected;
                }
                None => {
                    info!("{}: capture service closed the connection", name);
                    return SessionEnd::Disconnected;
                }
            },
            outbound = outbound_rx.recv() => {
                let Some(outbound) = outbound else {
                    debug!("{}: all producer handles dropped", name);
                    return SessionEnd::Abandoned;
                };
                let result = framed.send(outbound.message).await.map_err(ProducerError::from);
                let failed = result.is_err();
                let _ = outbound.ack.send(result);
                if failed {
                    warn!("{}: send failed, dropping connection", name);
                    return SessionEnd::Disconnected;
                }
            }
        }
    }
}
