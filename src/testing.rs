//! Shared fixtures for unit tests.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

/// Reader that replays a fixed script of chunks and errors, then EOF.
///
/// Each `Ok` chunk is delivered by exactly one `poll_read` (truncated to
/// the caller's buffer, remainder kept for the next read).
#[derive(Debug, Default)]
pub(crate) struct ScriptedReader {
    script: VecDeque<io::Result<Vec<u8>>>,
}

impl ScriptedReader {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn chunk(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.script.push_back(Ok(data.into()));
        self
    }

    pub(crate) fn error(mut self, kind: io::ErrorKind) -> Self {
        self.script.push_back(Err(io::Error::new(kind, "scripted failure")));
        self
    }
}

impl AsyncRead for ScriptedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.script.pop_front() {
            None => Poll::Ready(Ok(())),
            Some(Err(e)) => Poll::Ready(Err(e)),
            Some(Ok(mut data)) => {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    let rest = data.split_off(n);
                    self.script.push_front(Ok(rest));
                }
                Poll::Ready(Ok(()))
            }
        }
    }
}
