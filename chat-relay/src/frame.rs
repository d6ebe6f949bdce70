//! TCP wire framing.
//!
//! Every application message sent over a raw TCP socket is wrapped in a frame:
//!
//! ```text
//! +---------+-----------+---------------------+
//! | version | length    | payload             |
//! | "v1"    | u16 BE    | length - 4 bytes    |
//! +---------+-----------+---------------------+
//! ```
//!
//! `length` counts the whole frame, header included. WebSocket connections do not
//! use frames at all; the transport already delimits messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RelayError, Result};

pub const VERSION: [u8; 2] = *b"v1";
pub const HEADER_SIZE: usize = 4;
pub const MAX_FRAME_LENGTH: usize = u16::MAX as usize;
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_LENGTH - HEADER_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    version: [u8; 2],
    length: u16,
    payload: Bytes,
}

impl Frame {
    /// Wraps a serialized application message.
    pub fn encode(payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(RelayError::FrameTooLarge(payload.len()));
        }

        Ok(Self {
            version: VERSION,
            length: (HEADER_SIZE + payload.len()) as u16,
            payload,
        })
    }

    /// Reads one frame from `reader`: the fixed header first, then exactly
    /// `length - HEADER_SIZE` payload bytes.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
    pub async fn decode<R>(reader: &mut R) -> Result<Option<Self>>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_SIZE];
        let first = reader.read(&mut header[..1]).await?;
        if first == 0 {
            return Ok(None);
        }
        read_exact_or_malformed(reader, &mut header[1..], "header").await?;

        let version = [header[0], header[1]];
        if version != VERSION {
            return Err(RelayError::MalformedFrame(format!(
                "unknown version tag {version:02x?}"
            )));
        }

        let length = u16::from_be_bytes([header[2], header[3]]);
        let payload_len = checked_payload_len(length)?;

        let mut payload = vec![0u8; payload_len];
        read_exact_or_malformed(reader, &mut payload, "payload").await?;

        Ok(Some(Self {
            version,
            length,
            payload: payload.into(),
        }))
    }

    pub fn version(&self) -> [u8; 2] {
        self.version
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.length as usize);
        out.put_slice(&self.version);
        out.put_u16(self.length);
        out.put_slice(&self.payload);
        out.freeze()
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

fn checked_payload_len(length: u16) -> Result<usize> {
    (length as usize).checked_sub(HEADER_SIZE).ok_or_else(|| {
        RelayError::MalformedFrame(format!(
            "declared length {length} is shorter than the {HEADER_SIZE}-byte header"
        ))
    })
}

async fn read_exact_or_malformed<R>(reader: &mut R, buf: &mut [u8], part: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Err(
            RelayError::MalformedFrame(format!("stream closed inside frame {part}")),
        ),
        Err(err) => Err(err.into()),
    }
}

/// Reassembles frames from a TCP byte stream.
///
/// Bytes are appended as they arrive; [`FrameSplitter::split`] hands back one
/// complete frame at a time and keeps whatever follows it buffered, so the
/// resulting frame sequence does not depend on how the stream was chunked.
///
/// A stream that does not start with the version tag is not silently skipped:
/// `split` reports `MalformedFrame` and discards bytes up to the next version
/// tag, leaving the decision to give up to the caller.
#[derive(Debug, Default)]
pub struct FrameSplitter {
    buffer: BytesMut,
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Extracts the next complete frame.
    ///
    /// - `Ok(None)`: more bytes are needed (or the stream ended with nothing buffered).
    /// - `Ok(Some(frame))`: exactly `length` bytes were consumed.
    /// - `Err(MalformedFrame)`: bad tag, impossible length, or the stream ended
    ///   part-way through a frame. The partial frame stays buffered in the last
    ///   case, so every later call with `at_eof` reports it again.
    pub fn split(&mut self, at_eof: bool) -> Result<Option<Frame>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        if self.buffer[0] != VERSION[0] || self.buffer.get(1).is_some_and(|b| *b != VERSION[1]) {
            let found = [self.buffer[0], self.buffer.get(1).copied().unwrap_or_default()];
            self.discard_to_next_tag();
            return Err(RelayError::MalformedFrame(format!(
                "expected version tag, found {found:02x?}"
            )));
        }

        if self.buffer.len() < HEADER_SIZE {
            return self.incomplete(at_eof, HEADER_SIZE);
        }

        let length = u16::from_be_bytes([self.buffer[2], self.buffer[3]]);
        if let Err(err) = checked_payload_len(length) {
            self.discard_to_next_tag();
            return Err(err);
        }

        let length = length as usize;
        if self.buffer.len() < length {
            return self.incomplete(at_eof, length);
        }

        let mut token = self.buffer.split_to(length).freeze();
        token.advance(HEADER_SIZE);
        Ok(Some(Frame {
            version: VERSION,
            length: length as u16,
            payload: token,
        }))
    }

    fn incomplete(&self, at_eof: bool, wanted: usize) -> Result<Option<Frame>> {
        if at_eof {
            return Err(RelayError::MalformedFrame(format!(
                "stream ended after {} of {wanted} bytes",
                self.buffer.len()
            )));
        }
        Ok(None)
    }

    /// Drops the current leading byte and everything up to the next possible
    /// version tag. A lone trailing tag byte is kept since its partner may
    /// still be in flight.
    fn discard_to_next_tag(&mut self) {
        let skip = (1..self.buffer.len())
            .find(|&i| {
                self.buffer[i] == VERSION[0]
                    && self.buffer.get(i + 1).is_none_or(|next| *next == VERSION[1])
            })
            .unwrap_or(self.buffer.len());
        self.buffer.advance(skip);
    }
}
