//! Producer endpoints: `unix:///path/to.sock` or `tcp://host:port`.

use std::fmt;
use std::io;
#[cfg(unix)]
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("endpoint '{0}' has no scheme (expected unix:// or tcp://)")]
    MissingScheme(String),
    #[error("unsupported endpoint scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("endpoint '{0}' has an empty address")]
    EmptyAddress(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, address) = s
            .split_once("://")
            .ok_or_else(|| EndpointError::MissingScheme(s.to_string()))?;
        if address.is_empty() {
            return Err(EndpointError::EmptyAddress(s.to_string()));
        }
        match scheme {
            #[cfg(unix)]
            "unix" | "ipc" => Ok(Endpoint::Unix(captureconf::loader::expand_path(address))),
            "tcp" => Ok(Endpoint::Tcp(address.to_string())),
            other => Err(EndpointError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

impl Endpoint {
    pub async fn connect(&self) -> io::Result<PeerStream> {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(PeerStream::Unix(UnixStream::connect(path).await?)),
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(PeerStream::Tcp(stream))
            }
        }
    }

    /// Bind a listener. A leftover Unix socket file from a previous run is
    /// removed first.
    pub async fn bind(&self) -> io::Result<PeerListener> {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if path.exists() {
                    debug!("Removing stale socket {}", path.display());
                    std::fs::remove_file(path)?;
                }
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let listener = UnixListener::bind(path)?;
                Ok(PeerListener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            Endpoint::Tcp(addr) => Ok(PeerListener::Tcp(TcpListener::bind(addr.as_str()).await?)),
        }
    }
}

/// Accepting side of an [`Endpoint`].
pub enum PeerListener {
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl PeerListener {
    pub async fn accept(&self) -> io::Result<PeerStream> {
        match self {
            #[cfg(unix)]
            PeerListener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(PeerStream::Unix(stream))
            }
            PeerListener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                debug!("Accepted tcp peer {}", addr);
                stream.set_nodelay(true)?;
                Ok(PeerStream::Tcp(stream))
            }
        }
    }

    /// Endpoint peers should connect to. For `tcp://host:0` this carries the
    /// port the OS picked.
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            #[cfg(unix)]
            PeerListener::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
            PeerListener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
        }
    }
}

impl Drop for PeerListener {
    fn drop(&mut self) {
        match self {
            #[cfg(unix)]
            PeerListener::Unix { path, .. } => {
                if let Err(e) = std::fs::remove_file(path.as_path()) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!("Failed to remove socket {}: {}", path.display(), e);
                    }
                }
            }
            PeerListener::Tcp(_) => {}
        }
    }
}

/// A connected byte stream to a peer.
pub enum PeerStream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl AsyncRead for PeerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            PeerStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            PeerStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PeerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            #[cfg(unix)]
            PeerStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            PeerStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            PeerStream::Unix(s) => Pin::new(s).poll_flush(cx),
            PeerStream::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            PeerStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            PeerStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
