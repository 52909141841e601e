//! Accept loop for producer connections.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use captureproto::{Endpoint, HubCodec, PeerListener};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::connection::serve_connection;
use crate::lifecycle::CaptureLifecycle;

/// Back-off after a failed accept (fd exhaustion and the like).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct ProducerServer {
    listener: PeerListener,
    lifecycle: Arc<CaptureLifecycle>,
    max_frame_bytes: usize,
}

impl ProducerServer {
    pub async fn bind(
        endpoint: &Endpoint,
        lifecycle: Arc<CaptureLifecycle>,
        max_frame_bytes: usize,
    ) -> Result<Self> {
        let listener = endpoint
            .bind()
            .await
            .with_context(|| format!("Failed to bind producer endpoint {}", endpoint))?;
        Ok(Self {
            listener,
            lifecycle,
            max_frame_bytes,
        })
    }

    /// Where producers should connect; resolves `tcp://host:0` to the real port.
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.listener.local_endpoint()
    }

    /// Serve until shutdown is requested, then wait for every connection to
    /// wind down.
    pub async fn run(self) -> Result<()> {
        let shutdown = self.lifecycle.shutdown_token();
        let mut connections = JoinSet::new();
        info!("accepting producers on {}", self.local_endpoint()?);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(stream) => {
                        let codec = HubCodec::with_max_frame_bytes(self.max_frame_bytes);
                        connections.spawn(serve_connection(self.lifecycle.clone(), stream, codec));
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!("connection task failed: {}", e);
                    }
                }
            }
        }

        debug!("waiting for {} connections to close", connections.len());
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                warn!("connection task failed: {}", e);
            }
        }
        info!("producer server stopped");
        Ok(())
    }
}
