//! Length-prefixed frame codec.
//!
//! Frames are `[u32 BE length][u8 kind][length bytes]` in both directions.
//! JSON frames are parsed whole; binary frames stream through fixed-size
//! chunks so a file transfer never buffers its full payload.

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::messages::Message;

/// Upper bound for JSON frame payloads.
pub const MAX_JSON_FRAME: u32 = 1024 * 1024;

/// Default upper bound for binary frame payloads.
pub const DEFAULT_MAX_BINARY_FRAME: u32 = 256 * 1024 * 1024;

/// Chunk size for streamed binary payloads.
const BINARY_CHUNK: usize = 64 * 1024;

/// Frame kind discriminator byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Json,
    Binary,
}

impl FrameKind {
    pub fn as_byte(self) -> u8 {
        match self {
            FrameKind::Json => 0x01,
            FrameKind::Binary => 0x02,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(FrameKind::Json),
            0x02 => Some(FrameKind::Binary),
            _ => None,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

/// Framing errors.
///
/// `Closed` means end-of-stream was hit inside a frame header; there is no
/// way to resynchronize, so the caller must drop the connection. The other
/// protocol variants are reported after the offending payload has been
/// drained, but the connection is still considered unrecoverable by the
/// session layer because request/response pairing may be lost.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed while reading a frame header")]
    Closed,

    #[error("frame length {length} exceeds the {max} byte maximum")]
    InvalidLength { length: u32, max: u32 },

    #[error("unexpected frame kind byte 0x{kind:02x}")]
    UnexpectedKind { kind: u8 },

    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("JSON payload is not an object with a \"type\" field")]
    MissingType,
}

/// Frame-oriented view over one duplex byte stream.
///
/// The codec itself never applies timeouts; callers wrap individual reads in
/// `tokio::time::timeout` so the deadline's scope is exactly the awaited
/// exchange.
pub struct FrameStream<S> {
    stream: S,
    max_binary: u32,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FrameStream<S> {
    pub fn new(stream: S) -> Self {
        Self::with_max_binary(stream, DEFAULT_MAX_BINARY_FRAME)
    }

    pub fn with_max_binary(stream: S, max_binary: u32) -> Self {
        Self { stream, max_binary }
    }

    /// Shut down the write side of the underlying stream.
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }

    /// Access the underlying stream, mainly for scripted test peers.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Read one frame header, validating kind and per-kind length bounds.
    ///
    /// An oversized or unknown-kind frame has its payload drained before the
    /// error is returned, so the stream position ends on a frame boundary.
    async fn read_header(&mut self) -> Result<(FrameKind, u32), FrameError> {
        let mut len_buf = [0u8; 4];
        self.stream
            .read_exact(&mut len_buf)
            .await
            .map_err(map_header_eof)?;
        let length = u32::from_be_bytes(len_buf);

        let mut kind_buf = [0u8; 1];
        self.stream
            .read_exact(&mut kind_buf)
            .await
            .map_err(map_header_eof)?;

        let Some(kind) = FrameKind::from_byte(kind_buf[0]) else {
            warn!(kind = kind_buf[0], length, "Unknown frame kind, discarding payload");
            self.drain(length).await?;
            return Err(FrameError::UnexpectedKind { kind: kind_buf[0] });
        };

        let max = match kind {
            FrameKind::Json => MAX_JSON_FRAME,
            FrameKind::Binary => self.max_binary,
        };
        if length > max {
            warn!(length, max, ?kind, "Oversized frame, discarding payload");
            self.drain(length).await?;
            return Err(FrameError::InvalidLength { length, max });
        }

        Ok((kind, length))
    }

    /// Skip `length` payload bytes.
    async fn drain(&mut self, length: u32) -> Result<(), FrameError> {
        let mut remaining = length as u64;
        let mut buf = [0u8; BINARY_CHUNK];
        while remaining > 0 {
            let want = remaining.min(BINARY_CHUNK as u64) as usize;
            let n = self.stream.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(FrameError::Closed);
            }
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Read one complete frame into memory.
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        let (kind, length) = self.read_header().await?;
        let mut payload = vec![0u8; length as usize];
        self.stream.read_exact(&mut payload).await?;
        Ok(Frame {
            kind,
            payload: Bytes::from(payload),
        })
    }

    /// Read one JSON frame and parse it into a [`Message`].
    ///
    /// A binary frame in this position is a protocol violation; its payload
    /// is drained and `UnexpectedKind` is returned.
    pub async fn read_json(&mut self) -> Result<Message, FrameError> {
        let (kind, length) = self.read_header().await?;
        if kind == FrameKind::Json {
            let mut payload = vec![0u8; length as usize];
            self.stream.read_exact(&mut payload).await?;
            return Message::from_payload(&payload);
        }
        self.drain(length).await?;
        Err(FrameError::UnexpectedKind {
            kind: FrameKind::Binary.as_byte(),
        })
    }

    /// Read one binary frame, streaming its payload into `writer`.
    ///
    /// `progress` observes `(done, total)` after every chunk. A JSON frame in
    /// this position is drained and reported as `UnexpectedKind`. Returns the
    /// payload length.
    pub async fn read_binary_into<W, P>(
        &mut self,
        writer: &mut W,
        mut progress: P,
    ) -> Result<u64, FrameError>
    where
        W: AsyncWrite + Unpin,
        P: FnMut(u64, u64),
    {
        let (kind, length) = self.read_header().await?;
        if kind != FrameKind::Binary {
            self.drain(length).await?;
            return Err(FrameError::UnexpectedKind {
                kind: FrameKind::Json.as_byte(),
            });
        }

        let total = length as u64;
        let mut done = 0u64;
        let mut buf = [0u8; BINARY_CHUNK];
        while done < total {
            let want = (total - done).min(BINARY_CHUNK as u64) as usize;
            let n = self.stream.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(FrameError::Closed);
            }
            writer.write_all(&buf[..n]).await?;
            done += n as u64;
            progress(done, total);
        }
        writer.flush().await?;
        Ok(total)
    }

    /// Serialize `message` and write it as one JSON frame.
    pub async fn write_json<T: Serialize>(&mut self, message: &T) -> Result<(), FrameError> {
        let payload = serde_json::to_vec(message)?;
        if payload.len() > MAX_JSON_FRAME as usize {
            return Err(FrameError::InvalidLength {
                length: payload.len() as u32,
                max: MAX_JSON_FRAME,
            });
        }
        self.write_frame(FrameKind::Json, &payload).await
    }

    /// Write one complete frame from an in-memory payload.
    pub async fn write_frame(&mut self, kind: FrameKind, payload: &[u8]) -> Result<(), FrameError> {
        self.stream
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await?;
        self.stream.write_all(&[kind.as_byte()]).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Write one binary frame of exactly `total` bytes streamed from `reader`.
    ///
    /// `progress` observes `(done, total)` after every chunk.
    pub async fn write_binary_from<R, P>(
        &mut self,
        reader: &mut R,
        total: u64,
        mut progress: P,
    ) -> Result<(), FrameError>
    where
        R: AsyncRead + Unpin,
        P: FnMut(u64, u64),
    {
        if total > self.max_binary as u64 {
            return Err(FrameError::InvalidLength {
                length: total.min(u32::MAX as u64) as u32,
                max: self.max_binary,
            });
        }

        self.stream.write_all(&(total as u32).to_be_bytes()).await?;
        self.stream
            .write_all(&[FrameKind::Binary.as_byte()])
            .await?;

        let mut done = 0u64;
        let mut buf = [0u8; BINARY_CHUNK];
        while done < total {
            let want = (total - done).min(BINARY_CHUNK as u64) as usize;
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(FrameError::Closed);
            }
            self.stream.write_all(&buf[..n]).await?;
            done += n as u64;
            progress(done, total);
        }
        self.stream.flush().await?;
        Ok(())
    }
}

/// EOF inside a header means the peer went away between frames; surface it
/// as `Closed` rather than a generic IO failure.
fn map_header_eof(err: std::io::Error) -> FrameError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::Closed
    } else {
        FrameError::Io(err)
    }
}
