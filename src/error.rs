//! Error taxonomy for engine stream transports.
//!
//! Stream termination caused by the peer going away is not an error for
//! log/event/progress streams; those surface a [`Termination`] value
//! instead. [`Error::ConnectionLost`] is only returned where losing the
//! connection means an operation could not be carried out (for example a
//! write on an interactive exec session).
//!
//! [`Termination`]: crate::jsonstream::Termination

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for dockwire operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the stream transport layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame header or malformed JSON line. Fatal to the stream.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer closed or reset the connection while an operation needed it.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The HTTP upgrade handshake for exec/attach did not switch protocols.
    #[error("Upgrade failed ({status}): {message}")]
    UpgradeFailed {
        /// HTTP status returned instead of 101.
        status: u16,
        /// Engine-provided explanation, if any.
        message: String,
    },

    /// A caller-imposed deadline elapsed before the stream produced anything.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The transport was already closed.
    #[error("Transport is closed")]
    Closed,

    /// A TTY-only operation was attempted on a non-TTY session.
    #[error("Session was not started with a TTY")]
    NotTty,

    /// The engine answered with a non-success status.
    #[error("Engine error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// The `message` field of the engine's JSON error body.
        message: String,
    },

    /// HTTP client failure below the engine API level.
    #[error("HTTP error: {0}")]
    Http(String),

    /// A caller-supplied argument cannot be honored.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Raw I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// JSON (de)serialization failure outside of stream decoding.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` for I/O errors that mean the peer went away.
    ///
    /// Long-lived engine endpoints (events, logs, progress) are routinely
    /// closed by the daemon, so these end a stream instead of failing it.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::ConnectionLost(_) => true,
            Self::Io(e) => is_disconnect(e),
            _ => false,
        }
    }

    /// Returns `true` if this error is a caller-imposed timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Classify an I/O error as a peer disconnect.
#[must_use]
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

/// Run `future` with a caller deadline.
///
/// Elapsing yields [`Error::Timeout`]; the future is dropped but whatever
/// connection it was using is left to its owner.
pub async fn with_timeout<F, T>(limit: Duration, future: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_elapsed| Error::Timeout(limit))?
}

impl From<hyper::Error> for Error {
    fn from(err: hyper::Error) -> Self {
        if err.is_incomplete_message() || err.is_closed() || err.is_canceled() {
            Self::ConnectionLost(err.to_string())
        } else {
            Self::Http(err.to_string())
        }
    }
}
