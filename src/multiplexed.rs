//! Pull-style reader for multiplexed response bodies (container logs).
//!
//! Unlike the push-model [`FrameDecoder`](crate::framing::FrameDecoder),
//! which accepts arbitrary chunks, this reader asks the body for exactly one
//! header and then exactly one payload. Both parse headers with
//! [`FrameHeader::parse`].
//!
//! Log endpoints are long-lived: a reset, a server disconnect or a body that
//! ends halfway through a frame all end the sequence without an error. The
//! latter is reported through [`MultiplexedResult::truncated`].

use std::io;

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{self, Result};
use crate::framing::{Frame, FrameHeader, HEADER_SIZE};
use crate::jsonstream::Termination;

/// Read size used for raw TTY bodies.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Lazy sequence of frames read from a log-style response body.
pub struct MultiplexedResult<R> {
    reader: Option<R>,
    tty: bool,
    chunk_size: usize,
    truncated: bool,
    termination: Option<Termination>,
}

impl<R> std::fmt::Debug for MultiplexedResult<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexedResult")
            .field("tty", &self.tty)
            .field("open", &self.reader.is_some())
            .field("truncated", &self.truncated)
            .field("termination", &self.termination)
            .finish_non_exhaustive()
    }
}

impl<R: AsyncRead + Unpin> MultiplexedResult<R> {
    /// Wrap a response body. `tty` selects raw passthrough over header framing.
    pub fn new(reader: R, tty: bool) -> Self {
        Self {
            reader: Some(reader),
            tty,
            chunk_size: DEFAULT_CHUNK_SIZE,
            truncated: false,
            termination: None,
        }
    }

    /// Override the read size used in TTY mode.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Read the next non-empty frame.
    ///
    /// Returns `Ok(None)` when the body is exhausted or the connection drops.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`](crate::Error::Protocol) on a malformed
    /// header and [`Error::Io`](crate::Error::Io) on non-disconnect I/O
    /// failures.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.tty {
            self.next_raw().await
        } else {
            self.next_multiplexed().await
        }
    }

    /// Read the next frame and decode it as UTF-8 (lossily).
    ///
    /// A multi-byte character split across two frames is replaced by
    /// U+FFFD; use [`collect_lines`](Self::collect_lines) when that matters.
    pub async fn next_text(&mut self) -> Result<Option<String>> {
        Ok(self
            .next_frame()
            .await?
            .map(|frame| String::from_utf8_lossy(&frame.payload).into_owned()))
    }

    /// Drain the body, decode it as text and split it into lines with
    /// trailing whitespace removed.
    pub async fn collect_lines(mut self) -> Result<Vec<String>> {
        let mut raw = Vec::new();
        while let Some(frame) = self.next_frame().await? {
            raw.extend_from_slice(&frame.payload);
        }
        Ok(String::from_utf8_lossy(&raw)
            .lines()
            .map(|line| line.trim_end().to_string())
            .collect())
    }

    /// Drain the body and return every payload concatenated.
    pub async fn collect_bytes(mut self) -> Result<Bytes> {
        let mut raw = Vec::new();
        while let Some(frame) = self.next_frame().await? {
            raw.extend_from_slice(&frame.payload);
        }
        Ok(Bytes::from(raw))
    }

    /// Adapt into a [`Stream`] of frames.
    pub fn into_stream(self) -> impl Stream<Item = Result<Frame>> {
        stream::unfold(self, |mut this| async move {
            match this.next_frame().await {
                Ok(Some(frame)) => Some((Ok(frame), this)),
                Ok(None) => None,
                Err(e) => Some((Err(e), this)),
            }
        })
    }

    async fn next_raw(&mut self) -> Result<Option<Frame>> {
        let chunk_size = self.chunk_size;
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let mut buf = vec![0u8; chunk_size];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => return self.end(Termination::Eof, false),
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(Some(Frame::stdout(buf)));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.end_with_error(e, false),
            }
        }
    }

    async fn next_multiplexed(&mut self) -> Result<Option<Frame>> {
        loop {
            let Some(reader) = self.reader.as_mut() else {
                return Ok(None);
            };

            let mut raw = [0u8; HEADER_SIZE];
            let (filled, err) = fill(reader, &mut raw).await;
            if let Some(e) = err {
                return self.end_with_error(e, filled > 0);
            }
            if filled == 0 {
                return self.end(Termination::Eof, false);
            }
            if filled < HEADER_SIZE {
                return self.end(Termination::Eof, true);
            }

            let header = match FrameHeader::parse(&raw) {
                Ok(header) => header,
                Err(e) => {
                    self.finish(Termination::Failed);
                    return Err(e);
                }
            };
            if header.length == 0 {
                continue;
            }

            let mut payload = vec![0u8; header.length as usize];
            let (filled, err) = fill(reader, &mut payload).await;
            if let Some(e) = err {
                return self.end_with_error(e, true);
            }
            if filled < payload.len() {
                return self.end(Termination::Eof, true);
            }

            return Ok(Some(Frame::new(header.stream, payload)));
        }
    }

    fn end(&mut self, termination: Termination, mid_frame: bool) -> Result<Option<Frame>> {
        if mid_frame {
            log::debug!("[Multiplexed] Body ended inside a frame");
            self.truncated = true;
        }
        self.finish(termination);
        Ok(None)
    }

    fn end_with_error(&mut self, err: io::Error, mid_frame: bool) -> Result<Option<Frame>> {
        if error::is_disconnect(&err) {
            log::debug!("[Multiplexed] Connection dropped, ending stream: {err}");
            return self.end(Termination::ConnectionLost, mid_frame);
        }
        self.finish(Termination::Failed);
        Err(err.into())
    }
}

impl<R> MultiplexedResult<R> {
    /// Whether the body ended inside a frame.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Whether this result reads raw TTY output.
    pub fn is_tty(&self) -> bool {
        self.tty
    }

    /// How the sequence ended, or `None` while it is still open.
    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    /// Release the connection without draining it.
    pub fn close(&mut self) {
        if self.reader.is_some() {
            self.finish(Termination::Closed);
        }
    }

    fn finish(&mut self, termination: Termination) {
        // Dropping the reader releases the underlying connection.
        self.reader = None;
        if self.termination.is_none() {
            self.termination = Some(termination);
        }
    }
}

/// Read until `buf` is full or the source hits EOF.
///
/// Returns how many bytes were read, plus the error that stopped reading.
async fn fill<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> (usize, Option<io::Error>) {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return (filled, Some(e)),
        }
    }
    (filled, None)
}
