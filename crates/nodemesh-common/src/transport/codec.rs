use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::error::{ClusterError, Result};
use crate::protocol::Envelope;
use crate::transport::format::EnvelopeFormat;
use crate::transport::tcp::map_io_error;

/// Default upper bound for a frame payload, in bytes.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 65535;

/// Size of the big-endian length header in front of every frame.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest payload length a 4-byte header can describe
pub const MAX_ENCODABLE_FRAME_LENGTH: usize = u32::MAX as usize;

/// Length-prefixed framing for byte streams.
///
/// # Wire Format
///
/// ```text
/// [4-byte payload length, u32 big-endian] [payload]
/// ```
///
/// A payload longer than `max_frame_length` is rejected in both directions;
/// on the read side the caller is expected to drop the connection.
///
/// # Example
///
/// ```
/// use nodemesh_common::transport::FrameCodec;
///
/// let codec = FrameCodec::new();
/// let framed = codec.encode(b"hello").unwrap();
/// assert_eq!(&framed[..4], &[0, 0, 0, 5]);
///
/// let (payload, consumed) = codec.decode(&framed).unwrap().unwrap();
/// assert_eq!(payload, b"hello");
/// assert_eq!(consumed, framed.len());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    /// Sets the frame size limit, capped at what the 4-byte header can carry.
    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            max_frame_length: max_frame_length.min(MAX_ENCODABLE_FRAME_LENGTH),
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// Prepends the length header to `payload`.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        self.check_length(payload.len())?;

        let mut framed = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(payload);
        Ok(framed)
    }

    /// Extracts the first complete frame from `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a whole frame, otherwise
    /// the payload and the number of bytes consumed from `buf`.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        len_buf.copy_from_slice(&buf[..LENGTH_PREFIX_SIZE]);
        let len = u32::from_be_bytes(len_buf) as usize;
        self.check_length(len)?;

        let end = LENGTH_PREFIX_SIZE + len;
        if buf.len() < end {
            return Ok(None);
        }

        Ok(Some((buf[LENGTH_PREFIX_SIZE..end].to_vec(), end)))
    }

    /// Reads one frame from `reader`.
    ///
    /// Returns `Ok(None)` if the stream ends cleanly on a frame boundary. A
    /// stream that ends inside a header or payload is an error.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Option<Vec<u8>>>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        let mut filled = 0;
        while filled < LENGTH_PREFIX_SIZE {
            let n = reader
                .read(&mut len_buf[filled..])
                .await
                .map_err(|e| map_io_error(e, "reading length prefix"))?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ClusterError::Connection(
                    "stream closed inside length prefix".to_string(),
                ));
            }
            filled += n;
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        self.check_length(len)?;

        let mut payload = vec![0u8; len];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| map_io_error(e, "reading frame payload"))?;

        Ok(Some(payload))
    }

    /// Writes `payload` as one frame and flushes `writer`.
    pub async fn write_frame<W>(&self, writer: &mut W, payload: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let framed = self.encode(payload)?;
        writer
            .write_all(&framed)
            .await
            .map_err(|e| map_io_error(e, "writing frame"))?;
        writer
            .flush()
            .await
            .map_err(|e| map_io_error(e, "flushing stream"))?;
        Ok(())
    }

    fn check_length(&self, len: usize) -> Result<()> {
        if len > self.max_frame_length {
            return Err(ClusterError::FrameTooLarge {
                len,
                max: self.max_frame_length,
            });
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame codec combined with an envelope format.
///
/// This is what both ends of a connection use: envelopes go in, framed bytes
/// come out, and the other way round.
#[derive(Clone)]
pub struct EnvelopeCodec {
    format: Arc<dyn EnvelopeFormat>,
    frames: FrameCodec,
}

impl EnvelopeCodec {
    pub fn new(format: Arc<dyn EnvelopeFormat>, frames: FrameCodec) -> Self {
        Self { format, frames }
    }

    pub fn format_name(&self) -> &'static str {
        self.format.name()
    }

    pub fn frames(&self) -> FrameCodec {
        self.frames
    }

    /// Serializes and frames `envelope`.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let payload = self.format.encode(envelope)?;
        self.frames.encode(&payload)
    }

    /// Reads and deserializes the next envelope, `Ok(None)` on clean EOF.
    pub async fn read_envelope<R>(&self, reader: &mut R) -> Result<Option<Envelope>>
    where
        R: AsyncRead + Unpin,
    {
        match self.frames.read_frame(reader).await? {
            Some(payload) => Ok(Some(self.format.decode(&payload)?)),
            None => Ok(None),
        }
    }

    pub async fn write_envelope<W>(&self, writer: &mut W, envelope: &Envelope) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let payload = self.format.encode(envelope)?;
        self.frames.write_frame(writer, &payload).await
    }
}
