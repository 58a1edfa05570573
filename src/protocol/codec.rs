//! Length-delimited framing for the command channel.
//!
//! Layout: `u32` big-endian length `N`, then `N` bytes made of a `u64`
//! big-endian command sequence number followed by the JSON message. The
//! sequence number sits outside the JSON so an undecodable frame can still be
//! attributed to the command it belongs to.

use super::message::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const LEN_PREFIX: usize = 4;
const SEQ_PREFIX: usize = 8;
const DRAIN_CHUNK: usize = 16 * 1024;

/// Sequence number carried by frames that belong to no command.
pub const NO_SEQ: u64 = 0;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds receive buffer of {max} bytes")]
    Oversized { seq: u64, len: usize, max: usize },
    #[error("malformed frame body: {reason}")]
    Malformed { seq: u64, reason: String },
    #[error("frame shorter than its header ({0} bytes)")]
    ShortHeader(usize),
    #[error("connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Whether the stream is still aligned on a frame boundary after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::Oversized { .. } | FrameError::Malformed { .. })
    }

    pub fn seq(&self) -> Option<u64> {
        match self {
            FrameError::Oversized { seq, .. } | FrameError::Malformed { seq, .. } => Some(*seq),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    pub message: Message,
}

pub fn encode_frame(seq: u64, message: &Message) -> Result<Vec<u8>, serde_json::Error> {
    let body = message.to_bytes()?;
    let len = (SEQ_PREFIX + body.len()) as u32;
    let mut out = Vec::with_capacity(LEN_PREFIX + len as usize);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Reads one frame at a time, refusing bodies larger than `max_frame_len`.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    max_frame_len: usize,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_len: usize) -> Self {
        Self {
            inner,
            max_frame_len,
            buf: Vec::with_capacity(max_frame_len.min(64 * 1024)),
        }
    }

    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        let mut len_buf = [0u8; LEN_PREFIX];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FrameError::Closed),
            Err(e) => return Err(FrameError::Io(e)),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len < SEQ_PREFIX {
            return Err(FrameError::ShortHeader(len));
        }

        let mut seq_buf = [0u8; SEQ_PREFIX];
        self.read_body(&mut seq_buf).await?;
        let seq = u64::from_be_bytes(seq_buf);
        let body_len = len - SEQ_PREFIX;

        if len > self.max_frame_len {
            self.drain(body_len).await?;
            return Err(FrameError::Oversized { seq, len, max: self.max_frame_len });
        }

        self.buf.clear();
        self.buf.resize(body_len, 0);
        let mut body = std::mem::take(&mut self.buf);
        let read = self.read_body(&mut body).await;
        let decoded = read.map(|_| Message::from_slice(&body));
        self.buf = body;
        match decoded? {
            Ok(message) => Ok(Frame { seq, message }),
            Err(e) => Err(FrameError::Malformed { seq, reason: e.to_string() }),
        }
    }

    async fn read_body(&mut self, out: &mut [u8]) -> Result<(), FrameError> {
        match self.inner.read_exact(out).await {
            Ok(_) => Ok(()),
            // A frame cut off mid-body leaves the stream unusable.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FrameError::Closed),
            Err(e) => Err(FrameError::Io(e)),
        }
    }

    async fn drain(&mut self, mut remaining: usize) -> Result<(), FrameError> {
        let mut scratch = [0u8; DRAIN_CHUNK];
        while remaining > 0 {
            let step = remaining.min(DRAIN_CHUNK);
            self.read_body(&mut scratch[..step]).await?;
            remaining -= step;
        }
        Ok(())
    }
}
