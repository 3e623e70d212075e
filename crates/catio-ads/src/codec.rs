//! AMS/TCP framing and the AMS header.
//!
//! Frame layout on the wire:
//!
//! ```text
//! [0u8; 2] [length: u32] [AMS header: 32 bytes] [payload: length - 32]
//! ```
//!
//! All integers are little-endian.

use crate::command::CommandId;
use catio_common::error::{AdsError, AdsErrorCode, AdsResult};
use catio_common::net_id::AmsAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Size of the AMS/TCP envelope preceding the header.
pub const AMS_TCP_HEADER_SIZE: usize = 6;

/// Size of the AMS header.
pub const AMS_HEADER_SIZE: usize = 32;

/// Largest accepted header + payload length.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Bits of the AMS header state flags.
pub mod state_flags {
    /// Set on responses.
    pub const RESPONSE: u16 = 0x0001;
    /// Set on every ADS command frame.
    pub const ADS_COMMAND: u16 = 0x0004;
}

/// The 32-byte AMS header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmsHeader {
    /// Destination endpoint.
    pub target: AmsAddr,
    /// Originating endpoint.
    pub source: AmsAddr,
    /// Raw command id; see [`AmsHeader::command`].
    pub command_id: u16,
    /// Request/response and ADS command bits.
    pub state_flags: u16,
    /// Payload length in bytes.
    pub length: u32,
    /// AMS level error code.
    pub error_code: u32,
    /// Correlation token echoed by the responder.
    pub invoke_id: u32,
}

impl AmsHeader {
    /// Header of a request frame.
    #[must_use]
    pub fn request(target: AmsAddr, source: AmsAddr, command: CommandId, invoke_id: u32) -> Self {
        Self {
            target,
            source,
            command_id: command as u16,
            state_flags: state_flags::ADS_COMMAND,
            length: 0,
            error_code: 0,
            invoke_id,
        }
    }

    /// Header answering `self`: endpoints swapped, response bit set.
    #[must_use]
    pub fn response(&self, error: AdsErrorCode) -> Self {
        Self {
            target: self.source,
            source: self.target,
            command_id: self.command_id,
            state_flags: state_flags::ADS_COMMAND | state_flags::RESPONSE,
            length: 0,
            error_code: error.as_u32(),
            invoke_id: self.invoke_id,
        }
    }

    /// Parsed command id, `None` for ids outside the catalog.
    #[must_use]
    pub fn command(&self) -> Option<CommandId> {
        CommandId::from_u16(self.command_id)
    }

    /// Returns true if the response bit is set.
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.state_flags & state_flags::RESPONSE != 0
    }

    /// Header error code as a typed value.
    #[must_use]
    pub fn error(&self) -> AdsErrorCode {
        AdsErrorCode::from_u32(self.error_code)
    }

    /// Serialize the header to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; AMS_HEADER_SIZE] {
        let mut bytes = [0u8; AMS_HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.target.to_bytes());
        bytes[8..16].copy_from_slice(&self.source.to_bytes());
        bytes[16..18].copy_from_slice(&self.command_id.to_le_bytes());
        bytes[18..20].copy_from_slice(&self.state_flags.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.length.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.error_code.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.invoke_id.to_le_bytes());
        bytes
    }

    /// Parse a header from bytes.
    pub fn from_bytes(bytes: &[u8]) -> AdsResult<Self> {
        if bytes.len() < AMS_HEADER_SIZE {
            return Err(AdsError::Framing(format!(
                "AMS header too short: {} bytes",
                bytes.len()
            )));
        }
        let mut reader = ByteReader::new(&bytes[16..AMS_HEADER_SIZE]);
        Ok(Self {
            target: AmsAddr::from_bytes(&bytes[0..8])?,
            source: AmsAddr::from_bytes(&bytes[8..16])?,
            command_id: reader.u16()?,
            state_flags: reader.u16()?,
            length: reader.u32()?,
            error_code: reader.u32()?,
            invoke_id: reader.u32()?,
        })
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmsFrame {
    /// AMS header; `length` matches `payload.len()`.
    pub header: AmsHeader,
    /// ADS payload.
    pub payload: Vec<u8>,
}

/// Outcome of waiting for the next frame.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete frame.
    Frame(AmsFrame),
    /// No byte arrived within the idle timeout.
    Idle,
    /// The peer closed the stream between frames.
    Closed,
}

/// Encode a complete frame; the header length is taken from `payload`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode_frame(header: &AmsHeader, payload: &[u8]) -> Vec<u8> {
    let mut header = *header;
    header.length = payload.len() as u32;

    let total = AMS_HEADER_SIZE + payload.len();
    let mut frame = Vec::with_capacity(AMS_TCP_HEADER_SIZE + total);
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&(total as u32).to_le_bytes());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Decode one complete frame from a buffer holding exactly that frame.
pub fn decode_frame(bytes: &[u8]) -> AdsResult<AmsFrame> {
    if bytes.len() < AMS_TCP_HEADER_SIZE {
        return Err(AdsError::Framing(format!(
            "AMS/TCP envelope too short: {} bytes",
            bytes.len()
        )));
    }
    let declared = parse_envelope(&bytes[..AMS_TCP_HEADER_SIZE])?;
    let body = &bytes[AMS_TCP_HEADER_SIZE..];
    if body.len() != declared {
        return Err(AdsError::Framing(format!(
            "declared length {declared} but {} bytes follow",
            body.len()
        )));
    }
    decode_body(body)
}

/// Validate the envelope and return the declared header + payload length.
fn parse_envelope(envelope: &[u8]) -> AdsResult<usize> {
    if envelope[0] != 0 || envelope[1] != 0 {
        return Err(AdsError::Framing(format!(
            "reserved bytes not zero: {:02X} {:02X}",
            envelope[0], envelope[1]
        )));
    }
    let declared = u32::from_le_bytes([envelope[2], envelope[3], envelope[4], envelope[5]]) as usize;
    if declared < AMS_HEADER_SIZE {
        return Err(AdsError::Framing(format!(
            "declared length {declared} shorter than the AMS header"
        )));
    }
    if declared > MAX_FRAME_SIZE {
        return Err(AdsError::Framing(format!(
            "declared length {declared} exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }
    Ok(declared)
}

fn decode_body(body: &[u8]) -> AdsResult<AmsFrame> {
    let header = AmsHeader::from_bytes(body)?;
    let payload = &body[AMS_HEADER_SIZE..];
    if header.length as usize != payload.len() {
        return Err(AdsError::Framing(format!(
            "header length {} but payload has {} bytes",
            header.length,
            payload.len()
        )));
    }
    Ok(AmsFrame {
        header,
        payload: payload.to_vec(),
    })
}

/// Wait for the next frame on `reader`.
///
/// The first byte is awaited for up to `idle_timeout`; once it arrives the
/// remainder must complete within `frame_timeout`.
pub async fn read_frame<R>(
    reader: &mut R,
    idle_timeout: Duration,
    frame_timeout: Duration,
) -> AdsResult<ReadOutcome>
where
    R: AsyncRead + Unpin,
{
    let mut first = [0u8; 1];
    let n = match tokio::time::timeout(idle_timeout, reader.read(&mut first)).await {
        Err(_) => return Ok(ReadOutcome::Idle),
        Ok(result) => result?,
    };
    if n == 0 {
        return Ok(ReadOutcome::Closed);
    }

    let frame = tokio::time::timeout(frame_timeout, read_remainder(reader, first[0]))
        .await
        .map_err(|_| AdsError::Timeout(format!("frame incomplete after {frame_timeout:?}")))??;

    trace!(
        command = frame.header.command_id,
        invoke_id = frame.header.invoke_id,
        len = frame.payload.len(),
        "Received AMS frame"
    );
    Ok(ReadOutcome::Frame(frame))
}

async fn read_remainder<R>(reader: &mut R, first: u8) -> AdsResult<AmsFrame>
where
    R: AsyncRead + Unpin,
{
    let mut envelope = [0u8; AMS_TCP_HEADER_SIZE];
    envelope[0] = first;
    read_exact_or_eof(reader, &mut envelope[1..]).await?;
    let declared = parse_envelope(&envelope)?;

    let mut body = vec![0u8; declared];
    read_exact_or_eof(reader, &mut body).await?;
    decode_body(&body)
}

async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> AdsResult<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(AdsError::Transport("connection closed mid-frame".into()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Encode and write one frame.
pub async fn write_frame<W>(writer: &mut W, header: &AmsHeader, payload: &[u8]) -> AdsResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(header, payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    trace!(
        command = header.command_id,
        invoke_id = header.invoke_id,
        len = payload.len(),
        "Sent AMS frame"
    );
    Ok(())
}

/// Little-endian cursor over a payload.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Start reading at the beginning of `buf`.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Current position.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Take the next `n` bytes.
    pub fn bytes(&mut self, n: usize) -> AdsResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(AdsError::InvalidPayload(format!(
                "need {n} bytes at offset {}, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Take everything left.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    /// Skip `n` bytes.
    pub fn skip(&mut self, n: usize) -> AdsResult<()> {
        self.bytes(n).map(|_| ())
    }

    /// Read a `u8`.
    pub fn u8(&mut self) -> AdsResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    /// Read a little-endian `u16`.
    pub fn u16(&mut self) -> AdsResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a little-endian `u32`.
    pub fn u32(&mut self) -> AdsResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a little-endian `u64`.
    pub fn u64(&mut self) -> AdsResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    /// Read a `u32` length and then that many bytes.
    pub fn sized(&mut self) -> AdsResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.bytes(len)
    }
}
