//! Hijacked exec/attach sessions.
//!
//! After the HTTP upgrade the engine hands over the raw connection: stdin
//! goes out as plain bytes, output comes back either multiplexed or, for
//! TTY sessions, as a raw byte stream. [`HijackedTransport`] wraps that
//! connection with a shared read/write API.
//!
//! The connection is opened on first use. Concurrent first callers (a read
//! and a write racing, say) share a single establishment attempt.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;

use crate::error::{self, Error, Result};
use crate::framing::{Frame, StreamDecoder, StreamType};
use crate::transport::BoxedConnection;

/// Default size of the socket read buffer.
pub const DEFAULT_READ_BUFFER: usize = 64 * 1024;

/// An established connection, ready for session I/O.
#[derive(Debug)]
pub struct Established {
    /// The upgraded connection.
    pub connection: BoxedConnection,
    /// Whether the session runs with a TTY (raw output, no frame headers).
    pub tty: bool,
}

/// Opens the session connection. Called at most once per successful session.
#[async_trait]
pub trait Establish: Send + Sync {
    /// Perform the upgrade handshake and return the connection.
    async fn establish(&self) -> Result<Established>;
}

#[async_trait]
impl<F, Fut> Establish for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Established>> + Send,
{
    async fn establish(&self) -> Result<Established> {
        self().await
    }
}

/// Establisher over a connection that is already open.
#[derive(Debug)]
pub struct Preconnected {
    slot: StdMutex<Option<Established>>,
}

impl Preconnected {
    /// Hand out `connection` on the first establishment.
    pub fn new(connection: BoxedConnection, tty: bool) -> Self {
        Self {
            slot: StdMutex::new(Some(Established { connection, tty })),
        }
    }
}

#[async_trait]
impl Establish for Preconnected {
    async fn establish(&self) -> Result<Established> {
        self.slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .ok_or(Error::Closed)
    }
}

/// Changes the terminal size of a TTY session.
#[async_trait]
pub trait Resize: Send + Sync {
    /// Apply the new size.
    async fn resize(&self, rows: u16, cols: u16) -> Result<()>;
}

/// Lifecycle of a [`HijackedTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No connection yet; it opens on first read or write.
    Unestablished,
    /// Connection open.
    Established,
    /// Closed by the caller. Terminal.
    Closed,
}

struct ReadSide {
    reader: ReadHalf<BoxedConnection>,
    decoder: StreamDecoder,
    pending: VecDeque<Frame>,
    buf: Vec<u8>,
}

struct Session {
    tty: bool,
    read: Mutex<Option<ReadSide>>,
    write: Mutex<Option<WriteHalf<BoxedConnection>>>,
}

impl Session {
    fn new(established: Established, buffer_size: usize) -> Self {
        let (reader, writer) = tokio::io::split(established.connection);
        Self {
            tty: established.tty,
            read: Mutex::new(Some(ReadSide {
                reader,
                decoder: StreamDecoder::new(established.tty),
                pending: VecDeque::new(),
                buf: vec![0u8; buffer_size.max(1)],
            })),
            write: Mutex::new(Some(writer)),
        }
    }

    /// Shut down the write side and drop both halves.
    async fn release(&self) {
        if let Some(mut writer) = self.write.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                log::debug!("[Hijack] Shutdown on release failed: {e}");
            }
        }
        self.read.lock().await.take();
    }
}

/// Bidirectional byte stream over an upgraded exec/attach connection.
///
/// Share it behind an `Arc` to read and write from different tasks. Call
/// [`close`](Self::close) when done; it is idempotent.
pub struct HijackedTransport {
    label: String,
    establisher: Box<dyn Establish>,
    resizer: Option<Box<dyn Resize>>,
    session: OnceCell<Session>,
    closed: AtomicBool,
    truncated: AtomicBool,
    shutdown: CancellationToken,
    read_buffer: usize,
}

impl std::fmt::Debug for HijackedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HijackedTransport")
            .field("label", &self.label)
            .field("state", &self.state())
            .field("tty", &self.is_tty())
            .finish_non_exhaustive()
    }
}

impl HijackedTransport {
    /// Create an unestablished transport. `label` tags log lines.
    pub fn new(label: impl Into<String>, establisher: impl Establish + 'static) -> Self {
        Self {
            label: label.into(),
            establisher: Box::new(establisher),
            resizer: None,
            session: OnceCell::new(),
            closed: AtomicBool::new(false),
            truncated: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            read_buffer: DEFAULT_READ_BUFFER,
        }
    }

    /// Wrap a connection that is already upgraded.
    pub fn from_connection(label: impl Into<String>, connection: BoxedConnection, tty: bool) -> Self {
        Self::new(label, Preconnected::new(connection, tty))
    }

    /// Endpoint used by [`resize`](Self::resize).
    #[must_use]
    pub fn with_resizer(mut self, resizer: impl Resize + 'static) -> Self {
        self.resizer = Some(Box::new(resizer));
        self
    }

    /// Size of the socket read buffer.
    #[must_use]
    pub fn with_read_buffer(mut self, size: usize) -> Self {
        self.read_buffer = size.max(1);
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransportState {
        if self.closed.load(Ordering::SeqCst) {
            TransportState::Closed
        } else if self.session.initialized() {
            TransportState::Established
        } else {
            TransportState::Unestablished
        }
    }

    /// Whether the session has a TTY. `None` until established.
    pub fn is_tty(&self) -> Option<bool> {
        self.session.get().map(|session| session.tty)
    }

    /// Whether the connection ended in the middle of a frame.
    pub fn truncated(&self) -> bool {
        self.truncated.load(Ordering::SeqCst)
    }

    /// Open the connection now instead of on first use.
    pub async fn establish(&self) -> Result<()> {
        self.session().await.map(|_| ())
    }

    async fn session(&self) -> Result<&Session> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let session = self
            .session
            .get_or_try_init(|| async {
                let established = tokio::select! {
                    () = self.shutdown.cancelled() => return Err(Error::Closed),
                    result = self.establisher.establish() => result?,
                };
                log::debug!(
                    "[Hijack] {} established (tty={})",
                    self.label,
                    established.tty
                );
                Ok(Session::new(established, self.read_buffer))
            })
            .await?;

        // close() may have run while the handshake was in flight.
        if self.closed.load(Ordering::SeqCst) {
            session.release().await;
            return Err(Error::Closed);
        }
        Ok(session)
    }

    /// Read the next frame.
    ///
    /// TTY sessions yield raw chunks tagged as stdout. Returns `Ok(None)` at
    /// end of stream, after a peer disconnect, and after [`close`](Self::close).
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] on a malformed frame header; other I/O failures
    /// as [`Error::Io`]. Establishment errors are returned as-is.
    pub async fn read(&self) -> Result<Option<Frame>> {
        let session = match self.session().await {
            Ok(session) => session,
            Err(Error::Closed) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut guard = session.read.lock().await;
        loop {
            let Some(side) = guard.as_mut() else {
                return Ok(None);
            };
            if let Some(frame) = side.pending.pop_front() {
                return Ok(Some(frame));
            }
            if let Some(e) = side.decoder.take_error() {
                *guard = None;
                return Err(e);
            }

            let read = tokio::select! {
                () = self.shutdown.cancelled() => None,
                result = side.reader.read(&mut side.buf) => Some(result),
            };

            match read {
                None => {
                    *guard = None;
                    return Ok(None);
                }
                Some(Ok(0)) => {
                    if side.decoder.finish() {
                        log::warn!("[Hijack] {} ended mid-frame", self.label);
                        self.truncated.store(true, Ordering::SeqCst);
                    }
                    *guard = None;
                    return Ok(None);
                }
                Some(Ok(n)) => match side.decoder.decode(&side.buf[..n]) {
                    Ok(frames) => side
                        .pending
                        .extend(frames.into_iter().filter(|f| !f.payload.is_empty())),
                    Err(e) => {
                        *guard = None;
                        return Err(e);
                    }
                },
                Some(Err(e)) if error::is_disconnect(&e) => {
                    log::debug!("[Hijack] {} connection dropped: {e}", self.label);
                    if side.decoder.finish() {
                        self.truncated.store(true, Ordering::SeqCst);
                    }
                    *guard = None;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    *guard = None;
                    return Err(e.into());
                }
            }
        }
    }

    /// Write `data` to the session's stdin and flush it.
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] after [`close`](Self::close) or
    /// [`close_write`](Self::close_write); [`Error::ConnectionLost`] if the
    /// engine went away.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let session = self.session().await?;
        let mut guard = session.write.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(Error::Closed);
        };

        let result = tokio::select! {
            () = self.shutdown.cancelled() => return Err(Error::Closed),
            result = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => result,
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if error::is_disconnect(&e) => {
                log::debug!("[Hijack] {} write failed, connection lost: {e}", self.label);
                *guard = None;
                Err(Error::ConnectionLost(e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Half-close: signal end of stdin while still reading output.
    pub async fn close_write(&self) -> Result<()> {
        let session = self.session().await?;
        let Some(mut writer) = session.write.lock().await.take() else {
            return Ok(());
        };
        match writer.shutdown().await {
            Err(e) if !error::is_disconnect(&e) => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Change the TTY size.
    ///
    /// # Errors
    ///
    /// [`Error::NotTty`] for sessions started without a TTY.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let session = self.session().await?;
        if !session.tty {
            return Err(Error::NotTty);
        }
        match &self.resizer {
            Some(resizer) => resizer.resize(rows, cols).await,
            None => Err(Error::InvalidArgument(format!(
                "{} has no resize endpoint",
                self.label
            ))),
        }
    }

    /// Close the session. Safe to call more than once.
    ///
    /// Pending reads return `Ok(None)`, later writes fail with
    /// [`Error::Closed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        if let Some(session) = self.session.get() {
            session.release().await;
        }
        log::debug!("[Hijack] {} closed", self.label);
    }

    /// Pump `stdin` into the session and session output into `stdout` /
    /// `stderr` until the output ends. Closes the transport afterwards.
    ///
    /// End of `stdin` half-closes the session; output keeps flowing until
    /// the engine ends it.
    pub async fn relay<I, O, E>(&self, stdin: I, stdout: O, stderr: E) -> Result<()>
    where
        I: AsyncRead + Unpin + Send,
        O: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        let inbound = self.copy_output(stdout, stderr);
        let outbound = self.copy_input(stdin);
        tokio::pin!(inbound, outbound);

        let result = tokio::select! {
            result = &mut inbound => result,
            result = &mut outbound => match result {
                Ok(()) => inbound.await,
                Err(e) => Err(e),
            },
        };

        self.close().await;
        result
    }

    async fn copy_output<O, E>(&self, mut stdout: O, mut stderr: E) -> Result<()>
    where
        O: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        while let Some(frame) = self.read().await? {
            if frame.stream == StreamType::Stderr {
                stderr.write_all(&frame.payload).await?;
                stderr.flush().await?;
            } else {
                stdout.write_all(&frame.payload).await?;
                stdout.flush().await?;
            }
        }
        Ok(())
    }

    async fn copy_input<I>(&self, mut stdin: I) -> Result<()>
    where
        I: AsyncRead + Unpin + Send,
    {
        let mut buf = vec![0u8; 8192];
        loop {
            let n = stdin.read(&mut buf).await?;
            if n == 0 {
                return self.close_write().await;
            }
            self.write(&buf[..n]).await?;
        }
    }
}

impl Drop for HijackedTransport {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) && self.session.initialized() {
            log::warn!("[Hijack] {} dropped without close()", self.label);
        }
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::encode_frame;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};

    fn pair(tty: bool) -> (HijackedTransport, DuplexStream) {
        let (client, engine) = duplex(64 * 1024);
        (HijackedTransport::from_connection("test", Box::new(client), tty), engine)
    }

    #[tokio::test]
    async fn test_reads_are_lazy() {
        let (transport, _engine) = pair(false);
        assert_eq!(transport.state(), TransportState::Unestablished);
        assert_eq!(transport.is_tty(), None);
        transport.establish().await.unwrap();
        assert_eq!(transport.state(), TransportState::Established);
        transport.close().await;
    }

    #[tokio::test]
    async fn test_concurrent_first_use_establishes_once() {
        let (client, mut engine) = duplex(1024);
        let calls = Arc::new(AtomicUsize::new(0));
        let slot = Arc::new(StdMutex::new(Some(client)));

        let establisher = {
            let calls = Arc::clone(&calls);
            move || {
                let calls = Arc::clone(&calls);
                let slot = Arc::clone(&slot);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    let connection = slot.lock().unwrap().take().ok_or(Error::Closed)?;
                    Ok(Established {
                        connection: Box::new(connection),
                        tty: false,
                    })
                }
            }
        };
        let transport = HijackedTransport::new("race", establisher);

        let engine_task = tokio::spawn(async move {
            let mut input = [0u8; 4];
            engine.read_exact(&mut input).await.unwrap();
            engine
                .write_all(&encode_frame(StreamType::Stdout, &input))
                .await
                .unwrap();
            engine
        });

        let (written, read) = tokio::join!(transport.write(b"ping"), transport.read());
        written.unwrap();
        let frame = read.unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"ping");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        transport.close().await;
        drop(engine_task.await.unwrap());
    }

    #[tokio::test]
    async fn test_fragmented_frames_reassembled() {
        let (transport, mut engine) = pair(false);
        let mut bytes = encode_frame(StreamType::Stdout, b"hello ");
        bytes.extend(encode_frame(StreamType::Stderr, b"oops"));
        bytes.extend(encode_frame(StreamType::Stdout, b""));
        bytes.extend(encode_frame(StreamType::Stdout, b"world"));

        let writer = tokio::spawn(async move {
            for chunk in bytes.chunks(3) {
                engine.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            engine
        });

        let mut frames = Vec::new();
        while frames.len() < 3 {
            frames.push(transport.read().await.unwrap().unwrap());
        }
        assert_eq!(frames[0], Frame::new(StreamType::Stdout, &b"hello "[..]));
        assert_eq!(frames[1], Frame::new(StreamType::Stderr, &b"oops"[..]));
        assert_eq!(frames[2], Frame::new(StreamType::Stdout, &b"world"[..]));

        drop(writer.await.unwrap());
        assert!(transport.read().await.unwrap().is_none());
        assert!(!transport.truncated());
        transport.close().await;
    }

    #[tokio::test]
    async fn test_tty_output_is_raw() {
        let (transport, mut engine) = pair(true);
        engine.write_all(b"\x01\x00raw bytes").await.unwrap();
        let frame = transport.read().await.unwrap().unwrap();
        assert_eq!(frame.stream, StreamType::Stdout);
        assert_eq!(frame.payload.as_ref(), b"\x01\x00raw bytes");
        assert_eq!(transport.is_tty(), Some(true));
        transport.close().await;
    }

    #[tokio::test]
    async fn test_truncated_frame_flagged() {
        let (transport, mut engine) = pair(false);
        let bytes = encode_frame(StreamType::Stdout, b"cut short");
        engine.write_all(&bytes[..10]).await.unwrap();
        drop(engine);
        assert!(transport.read().await.unwrap().is_none());
        assert!(transport.truncated());
        transport.close().await;
    }

    #[tokio::test]
    async fn test_invalid_header_is_protocol_error() {
        let (transport, mut engine) = pair(false);
        engine.write_all(&[9, 0, 0, 0, 0, 0, 0, 1, b'x']).await.unwrap();
        assert!(matches!(transport.read().await, Err(Error::Protocol(_))));
        transport.close().await;
    }

    #[tokio::test]
    async fn test_frames_before_invalid_header_are_delivered() {
        let (transport, mut engine) = pair(false);
        let mut bytes = encode_frame(StreamType::Stdout, b"good");
        bytes.extend_from_slice(&[9, 0, 0, 0, 0, 0, 0, 0]);
        engine.write_all(&bytes).await.unwrap();

        let frame = transport.read().await.unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"good");
        assert!(matches!(transport.read().await, Err(Error::Protocol(_))));
        transport.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (transport, _engine) = pair(false);
        transport.establish().await.unwrap();
        transport.close().await;
        transport.close().await;
        assert_eq!(transport.state(), TransportState::Closed);
        assert!(transport.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (transport, _engine) = pair(false);
        transport.close().await;
        assert!(matches!(transport.write(b"x").await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let (transport, _engine) = pair(false);
        let transport = Arc::new(transport);
        transport.establish().await.unwrap();

        let reader = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.read().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.close().await;

        let result = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("read not unblocked")
            .unwrap();
        assert!(result.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_to_vanished_engine_is_connection_lost() {
        let (transport, engine) = pair(false);
        transport.establish().await.unwrap();
        drop(engine);
        assert!(matches!(
            transport.write(b"hello").await,
            Err(Error::ConnectionLost(_))
        ));
        transport.close().await;
    }

    #[tokio::test]
    async fn test_resize_requires_tty() {
        let (transport, _engine) = pair(false);
        assert!(matches!(transport.resize(24, 80).await, Err(Error::NotTty)));
        transport.close().await;
    }

    #[tokio::test]
    async fn test_resize_uses_endpoint() {
        struct Recorder(Arc<StdMutex<Vec<(u16, u16)>>>);

        #[async_trait]
        impl Resize for Recorder {
            async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
                self.0.lock().unwrap().push((rows, cols));
                Ok(())
            }
        }

        let sizes = Arc::new(StdMutex::new(Vec::new()));
        let (client, _engine) = duplex(1024);
        let transport = HijackedTransport::from_connection("tty", Box::new(client), true)
            .with_resizer(Recorder(Arc::clone(&sizes)));
        transport.resize(40, 120).await.unwrap();
        assert_eq!(*sizes.lock().unwrap(), vec![(40, 120)]);
        transport.close().await;
    }

    #[tokio::test]
    async fn test_relay_routes_streams() {
        let (transport, mut engine) = pair(false);

        let engine_task = tokio::spawn(async move {
            let mut input = Vec::new();
            engine.read_to_end(&mut input).await.unwrap();
            engine
                .write_all(&encode_frame(StreamType::Stdout, &input))
                .await
                .unwrap();
            engine
                .write_all(&encode_frame(StreamType::Stderr, b"warning"))
                .await
                .unwrap();
        });

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        transport
            .relay(&b"echo me"[..], &mut stdout, &mut stderr)
            .await
            .unwrap();
        engine_task.await.unwrap();

        assert_eq!(stdout, b"echo me");
        assert_eq!(stderr, b"warning");
        assert_eq!(transport.state(), TransportState::Closed);
    }
}
