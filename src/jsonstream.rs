//! Newline-delimited JSON decoding for progress-style endpoints.
//!
//! Events, image pull/push/build progress and stats are served as one JSON
//! document per line on a response that may stay open indefinitely. The
//! daemon routinely drops these connections, so a reset is reported as a
//! normal end of stream; [`JsonLineStream::termination`] tells the caller
//! how the stream actually ended.

use futures_util::stream::{self, Stream};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{self, Error, Result};

/// Longest line accepted by default, newline included (16 MB).
pub const DEFAULT_MAX_LINE_SIZE: usize = 16 * 1024 * 1024;

/// How a JSON line stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The source reported end of input.
    Eof,
    /// The peer reset or dropped the connection.
    ConnectionLost,
    /// The consumer closed the stream.
    Closed,
    /// A malformed line or I/O failure ended the stream.
    Failed,
}

impl Termination {
    /// Returns `true` unless the stream ended on an error.
    pub fn is_clean(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

type Transform = Box<dyn FnMut(Value) -> Value + Send>;

/// Lazy sequence of JSON values read one line at a time.
pub struct JsonLineStream<R> {
    reader: Option<R>,
    transform: Option<Transform>,
    line: Vec<u8>,
    max_line: usize,
    termination: Option<Termination>,
}

impl<R> std::fmt::Debug for JsonLineStream<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLineStream")
            .field("open", &self.reader.is_some())
            .field("termination", &self.termination)
            .finish_non_exhaustive()
    }
}

impl<R: AsyncBufRead + Unpin> JsonLineStream<R> {
    /// Wrap a line-readable source.
    pub fn new(reader: R) -> Self {
        Self {
            reader: Some(reader),
            transform: None,
            line: Vec::new(),
            max_line: DEFAULT_MAX_LINE_SIZE,
            termination: None,
        }
    }

    /// Reject lines longer than `max_line` bytes.
    #[must_use]
    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line.max(1);
        self
    }

    /// Apply `transform` to every decoded value before it is returned.
    #[must_use]
    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: FnMut(Value) -> Value + Send + 'static,
    {
        self.transform = Some(Box::new(transform));
        self
    }

    /// Decode the next non-blank line.
    ///
    /// Returns `Ok(None)` once the stream has ended, whatever the reason.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for a line that is not valid JSON or is
    /// longer than the line limit, and
    /// [`Error::Io`] for I/O failures other than a disconnect. Either ends
    /// the stream.
    pub async fn next(&mut self) -> Result<Option<Value>> {
        loop {
            let Some(reader) = self.reader.as_mut() else {
                return Ok(None);
            };

            self.line.clear();
            let limit = u64::try_from(self.max_line).unwrap_or(u64::MAX).saturating_add(1);
            match reader.take(limit).read_until(b'\n', &mut self.line).await {
                Ok(0) => {
                    self.finish(Termination::Eof);
                    return Ok(None);
                }
                Ok(_) => {}
                Err(e) if error::is_disconnect(&e) => {
                    log::debug!("[JsonStream] Connection dropped, ending stream: {e}");
                    self.finish(Termination::ConnectionLost);
                    return Ok(None);
                }
                Err(e) => {
                    self.finish(Termination::Failed);
                    return Err(e.into());
                }
            }

            if self.line.len() > self.max_line {
                self.finish(Termination::Failed);
                return Err(Error::Protocol(format!(
                    "JSON line exceeds {} bytes",
                    self.max_line
                )));
            }

            let line = self.line.trim_ascii();
            if line.is_empty() {
                continue;
            }

            let value: Value = match serde_json::from_slice(line) {
                Ok(value) => value,
                Err(e) => {
                    self.finish(Termination::Failed);
                    return Err(Error::Protocol(format!("Invalid JSON line: {e}")));
                }
            };

            return Ok(Some(match self.transform.as_mut() {
                Some(transform) => transform(value),
                None => value,
            }));
        }
    }

    /// Drain the stream into an ordered list.
    pub async fn collect(mut self) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        while let Some(value) = self.next().await? {
            values.push(value);
        }
        Ok(values)
    }

    /// Adapt into a [`Stream`]. The first error is yielded, then the stream ends.
    pub fn into_stream(self) -> impl Stream<Item = Result<Value>> {
        stream::unfold(self, |mut this| async move {
            match this.next().await {
                Ok(Some(value)) => Some((Ok(value), this)),
                Ok(None) => None,
                Err(e) => Some((Err(e), this)),
            }
        })
    }
}

impl<R> JsonLineStream<R> {
    /// How the stream ended, or `None` while it is still open.
    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    /// Release the underlying connection without draining it.
    pub fn close(&mut self) {
        if self.reader.is_some() {
            self.finish(Termination::Closed);
        }
    }

    fn finish(&mut self, termination: Termination) {
        self.reader = None;
        if self.termination.is_none() {
            self.termination = Some(termination);
        }
    }
}
