//! Envelope framing and serialization
//!
//! # Message Framing
//!
//! Every envelope is sent as one frame, on streams and datagrams alike:
//! ```text
//! ┌─────────────┬─────────────────────────────────┐
//! │ Length (4B) │ Payload (bincode-encoded)       │
//! └─────────────┴─────────────────────────────────┘
//! ```
//! The length is big-endian and counts payload bytes only. A datagram must
//! carry exactly one complete frame.

use std::io::{self, Read, Write};

use bincode::Options;

use crate::message::Envelope;

// ============================================================================
// Constants
// ============================================================================

/// Maximum payload size (64 KB, also the UDP datagram ceiling)
pub const MAX_MESSAGE_SIZE: u32 = 65536;

/// Length of the frame header (4 bytes for length)
pub const HEADER_LEN: usize = 4;

/// Fixed-width integers, same layout as `bincode::serialize`; a payload
/// must be consumed completely
fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

// ============================================================================
// Message Encoding/Decoding
// ============================================================================

/// Encode an envelope with 4-byte length prefix
pub fn encode_message(msg: &Envelope) -> Result<Vec<u8>, EncodeError> {
    let payload = wire_options()
        .serialize(msg)
        .map_err(|e| EncodeError::Serialization(e.to_string()))?;

    if payload.len() > MAX_MESSAGE_SIZE as usize {
        return Err(EncodeError::MessageTooLarge(payload.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);

    Ok(buf)
}

/// Decode an envelope from a length-prefixed buffer
///
/// Returns (message, bytes_consumed) or error
pub fn decode_message(buf: &[u8]) -> Result<(Envelope, usize), DecodeError> {
    if buf.len() < HEADER_LEN {
        return Err(DecodeError::Incomplete(HEADER_LEN - buf.len()));
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_MESSAGE_SIZE as usize {
        return Err(DecodeError::TooLarge(length));
    }

    let total = HEADER_LEN + length;
    if buf.len() < total {
        return Err(DecodeError::Incomplete(total - buf.len()));
    }

    let msg = wire_options()
        .deserialize(&buf[HEADER_LEN..total])
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;

    Ok((msg, total))
}

/// Decode a datagram that must hold exactly one frame
pub fn decode_datagram(buf: &[u8]) -> Result<Envelope, DecodeError> {
    match decode_message(buf) {
        Ok((msg, consumed)) if consumed == buf.len() => Ok(msg),
        Ok((_, consumed)) => Err(DecodeError::Malformed(format!(
            "{} trailing bytes after frame",
            buf.len() - consumed
        ))),
        // A datagram never continues in a later read
        Err(DecodeError::Incomplete(needed)) => Err(DecodeError::Malformed(format!(
            "truncated datagram, {} bytes missing",
            needed
        ))),
        Err(e) => Err(e),
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during message encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Serialization failed
    Serialization(String),
    /// Message exceeds maximum size
    MessageTooLarge(usize),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::Serialization(e) => write!(f, "serialization error: {}", e),
            EncodeError::MessageTooLarge(size) => {
                write!(
                    f,
                    "message too large: {} bytes (max {})",
                    size, MAX_MESSAGE_SIZE
                )
            }
        }
    }
}

impl std::error::Error for EncodeError {}

/// Errors that can occur during message decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data (need N more bytes)
    Incomplete(usize),
    /// Declared length exceeds maximum size
    TooLarge(usize),
    /// Bytes do not form a valid envelope
    Malformed(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Incomplete(needed) => {
                write!(f, "incomplete message, need {} more bytes", needed)
            }
            DecodeError::TooLarge(size) => {
                write!(
                    f,
                    "message too large: {} bytes (max {})",
                    size, MAX_MESSAGE_SIZE
                )
            }
            DecodeError::Malformed(e) => write!(f, "malformed message: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

// ============================================================================
// Stream-based I/O (for TCP connections)
// ============================================================================

/// Write an envelope to a writer with length prefix
pub fn write_message<W: Write>(writer: &mut W, msg: &Envelope) -> io::Result<()> {
    let encoded = encode_message(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&encoded)?;
    writer.flush()
}

/// Read one raw frame (header included) from a reader
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between
/// frames. The payload is not decoded, so the exact bytes can be relayed.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;

    while filled < HEADER_LEN {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed inside frame header",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_MESSAGE_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            DecodeError::TooLarge(length),
        ));
    }

    let mut frame = vec![0u8; HEADER_LEN + length];
    frame[..HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut frame[HEADER_LEN..])?;

    Ok(Some(frame))
}

/// Read and decode one envelope from a reader
///
/// Blocks until a complete message is received. A clean close before the
/// first header byte is reported as `UnexpectedEof`.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Envelope> {
    let frame = read_frame(reader)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed"))?;

    decode_message(&frame)
        .map(|(msg, _)| msg)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

// ============================================================================
// Tests
// ============================================================================
