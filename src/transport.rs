//! Duplex byte connections to the engine.
//!
//! Everything above this module talks to the engine through a
//! [`Connection`]: any tokio `AsyncRead + AsyncWrite` byte pipe. The
//! operations the stream layer relies on map onto the tokio extension
//! traits:
//!
//! | Operation | tokio |
//! |-----------|-------|
//! | read up to N bytes | `AsyncReadExt::read` |
//! | read exactly N bytes | `AsyncReadExt::read_exact` |
//! | read one line | `AsyncBufReadExt::read_until` |
//! | write | `AsyncWriteExt::write_all` |
//! | close (half-close) | `AsyncWriteExt::shutdown` |
//!
//! A [`Connector`] opens a fresh connection per request. TLS and SSH
//! tunnels are expected to be provided as custom connectors.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};

/// A duplex byte connection to the engine.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl std::fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Connection")
    }
}

/// Type-erased connection.
pub type BoxedConnection = Box<dyn Connection>;

/// Opens connections to the engine.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// Open a new connection.
    async fn connect(&self) -> io::Result<BoxedConnection>;
}

/// Where the engine listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineHost {
    /// Unix domain socket path.
    Unix(PathBuf),
    /// TCP `host:port`.
    Tcp(String),
}

/// Default engine socket.
pub const DEFAULT_HOST: &str = "unix:///var/run/docker.sock";

impl EngineHost {
    /// Parse a `DOCKER_HOST`-style address.
    ///
    /// Accepts `unix:///path`, `tcp://host:port`, `http://host:port` and a
    /// bare absolute socket path.
    pub fn parse(host: &str) -> Result<Self> {
        if let Some(path) = host.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(Error::Config(format!("Empty socket path in '{host}'")));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        for scheme in ["tcp://", "http://"] {
            if let Some(addr) = host.strip_prefix(scheme) {
                let addr = addr.trim_end_matches('/');
                if addr.is_empty() {
                    return Err(Error::Config(format!("Empty address in '{host}'")));
                }
                return Ok(Self::Tcp(addr.to_string()));
            }
        }
        if host.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(host)));
        }
        Err(Error::Config(format!("Unsupported engine host '{host}'")))
    }

    /// Build the connector for this address.
    pub fn connector(&self) -> Arc<dyn Connector> {
        match self {
            Self::Unix(path) => Arc::new(UnixConnector::new(path.clone())),
            Self::Tcp(addr) => Arc::new(TcpConnector::new(addr.clone())),
        }
    }
}

/// Connects over a Unix domain socket.
#[derive(Debug, Clone)]
pub struct UnixConnector {
    path: PathBuf,
}

impl UnixConnector {
    /// Create a connector for the socket at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Connector for UnixConnector {
    async fn connect(&self) -> io::Result<BoxedConnection> {
        #[cfg(unix)]
        {
            let stream = tokio::net::UnixStream::connect(&self.path).await?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("Unix sockets unavailable: {}", self.path.display()),
            ))
        }
    }
}

/// Connects over plain TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    /// Create a connector for `host:port`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<BoxedConnection> {
        let stream = tokio::net::TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
