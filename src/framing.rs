//! Wire codec for the engine's multiplexed stdout/stderr stream.
//!
//! Non-TTY logs, attach and exec sessions interleave stdout and stderr on a
//! single byte stream. Each chunk is prefixed with an 8-byte header:
//!
//! ```text
//! [u8 stream] [3 reserved bytes] [u32 BE length] [payload: length bytes]
//! ```
//!
//! Stream selectors:
//! - `0`: stdin (written by the engine only when echoing input)
//! - `1`: stdout
//! - `2`: stderr
//!
//! Sessions created with a TTY have no framing at all; every chunk read from
//! the connection is raw terminal output. [`StreamDecoder`] captures that
//! choice once, when the session is set up.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Maximum payload size accepted from the engine (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Which standard stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamType {
    /// Standard input.
    Stdin = 0,
    /// Standard output.
    Stdout = 1,
    /// Standard error.
    Stderr = 2,
}

impl StreamType {
    /// The selector byte used on the wire.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for StreamType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Stdin),
            1 => Ok(Self::Stdout),
            2 => Ok(Self::Stderr),
            other => Err(Error::Protocol(format!(
                "Invalid stream selector: 0x{other:02x}"
            ))),
        }
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdin => write!(f, "stdin"),
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// A decoded unit of the multiplexed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Source stream of the payload.
    pub stream: StreamType,
    /// Payload bytes, possibly empty.
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame.
    pub fn new(stream: StreamType, payload: impl Into<Bytes>) -> Self {
        Self {
            stream,
            payload: payload.into(),
        }
    }

    /// Create a stdout frame. TTY output is always reported this way.
    pub fn stdout(payload: impl Into<Bytes>) -> Self {
        Self::new(StreamType::Stdout, payload)
    }

    /// Encode this frame into its wire representation.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        encode_frame(self.stream, &self.payload)
    }
}

/// Encode a payload with a multiplexed-stream header.
///
/// Reserved header bytes are written as zero.
#[must_use]
pub fn encode_frame(stream: StreamType, payload: &[u8]) -> Vec<u8> {
    let length = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.push(stream.as_u8());
    buf.extend_from_slice(&[0, 0, 0]);
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(&payload[..length as usize]);
    buf
}

/// A parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Stream the following payload belongs to.
    pub stream: StreamType,
    /// Payload length in bytes.
    pub length: u32,
}

impl FrameHeader {
    /// Parse an 8-byte header. Reserved bytes are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the selector byte is not 0, 1 or 2, or
    /// if the length exceeds [`MAX_FRAME_SIZE`].
    pub fn parse(header: &[u8; HEADER_SIZE]) -> Result<Self> {
        let stream = StreamType::try_from(header[0])?;
        let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if length > MAX_FRAME_SIZE {
            return Err(Error::Protocol(format!(
                "Frame too large: {length} bytes (max {MAX_FRAME_SIZE})"
            )));
        }
        Ok(Self { stream, length })
    }
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete frames.
/// Frames may be split across reads at any byte boundary, including inside
/// the header.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    failed: bool,
    /// Error found after frames that were already returned.
    deferred: Option<Error>,
}

impl FrameDecoder {
    /// Create a new decoder with empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the decoder and extract all complete frames.
    ///
    /// Returns decoded frames in arrival order, including zero-length ones.
    /// Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on an invalid header. Frames decoded before
    /// the bad header in the same call are still returned; the error then
    /// comes from the next call (or [`take_error`](Self::take_error)). The
    /// decoder is unusable afterwards and keeps returning an error.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>> {
        if let Some(e) = self.deferred.take() {
            return Err(e);
        }
        if self.failed {
            return Err(Error::Protocol("Decoder already failed".to_string()));
        }
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < HEADER_SIZE {
                break;
            }

            let mut raw = [0u8; HEADER_SIZE];
            raw.copy_from_slice(&self.buf[..HEADER_SIZE]);
            let header = match FrameHeader::parse(&raw) {
                Ok(header) => header,
                Err(e) => {
                    self.failed = true;
                    self.buf.clear();
                    if frames.is_empty() {
                        return Err(e);
                    }
                    self.deferred = Some(e);
                    break;
                }
            };

            let total = HEADER_SIZE + header.length as usize;
            if self.buf.len() < total {
                break; // Incomplete frame, wait for more data
            }

            self.buf.advance(HEADER_SIZE);
            let payload = self.buf.split_to(header.length as usize).freeze();
            frames.push(Frame {
                stream: header.stream,
                payload,
            });
        }

        Ok(frames)
    }

    /// Returns true if the decoder has buffered partial data.
    ///
    /// At end of stream this means the final frame was truncated.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Number of buffered bytes not yet forming a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Signal end of input. Returns `true` if the stream ended inside a
    /// frame; the partial bytes are discarded.
    pub fn finish(&mut self) -> bool {
        let truncated = self.has_partial();
        self.buf.clear();
        truncated
    }

    /// Take the error held back by the last [`feed`](Self::feed), if any.
    pub fn take_error(&mut self) -> Option<Error> {
        self.deferred.take()
    }
}

/// Decoding strategy for an engine stream, fixed when the stream is opened.
#[derive(Debug)]
pub enum StreamDecoder {
    /// Non-TTY session: 8-byte header framing.
    Multiplexed(FrameDecoder),
    /// TTY session: raw passthrough, every chunk is stdout.
    Raw,
}

impl StreamDecoder {
    /// Select the decoder for a session.
    pub fn new(tty: bool) -> Self {
        if tty {
            Self::Raw
        } else {
            Self::Multiplexed(FrameDecoder::new())
        }
    }

    /// Whether this decoder passes raw TTY output through.
    pub fn is_tty(&self) -> bool {
        matches!(self, Self::Raw)
    }

    /// Decode a chunk read from the connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on malformed multiplexed headers.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<Vec<Frame>> {
        match self {
            Self::Multiplexed(decoder) => decoder.feed(bytes),
            Self::Raw if bytes.is_empty() => Ok(Vec::new()),
            Self::Raw => Ok(vec![Frame::stdout(Bytes::copy_from_slice(bytes))]),
        }
    }

    /// Returns true if a multiplexed frame is partially buffered.
    pub fn has_partial(&self) -> bool {
        match self {
            Self::Multiplexed(decoder) => decoder.has_partial(),
            Self::Raw => false,
        }
    }

    /// Signal end of input. Returns `true` if a frame was cut short.
    pub fn finish(&mut self) -> bool {
        match self {
            Self::Multiplexed(decoder) => decoder.finish(),
            Self::Raw => false,
        }
    }

    /// Take a decode error held back behind already returned frames.
    pub fn take_error(&mut self) -> Option<Error> {
        match self {
            Self::Multiplexed(decoder) => decoder.take_error(),
            Self::Raw => None,
        }
    }
}
