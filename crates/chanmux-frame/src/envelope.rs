use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Envelope header: magic (2) + length (4) = 6 bytes.
pub const ENVELOPE_HEADER_SIZE: usize = 6;

/// Magic bytes: "CM" (0x43 0x4D).
pub const MAGIC: [u8; 2] = [0x43, 0x4d];

/// Default maximum message size: 16 MiB.
pub const DEFAULT_MAX_MESSAGE: usize = 16 * 1024 * 1024;

/// Encode one message (normally an encoded frame) into an envelope.
///
/// ```text
/// ┌──────────────┬───────────┬──────────────────┐
/// │ Magic (2B)   │ Length    │ Message          │
/// │ 0x43 0x4D    │ (4B LE)   │ (Length bytes)   │
/// └──────────────┴───────────┴──────────────────┘
/// ```
pub fn encode_envelope(message: &[u8], dst: &mut BytesMut) -> Result<()> {
    if message.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: message.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(ENVELOPE_HEADER_SIZE + message.len());
    dst.put_slice(&MAGIC);
    dst.put_u32_le(message.len() as u32);
    dst.put_slice(message);
    Ok(())
}

/// Decode one envelope from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't hold a complete envelope yet.
/// On success the envelope bytes are consumed from `src`.
pub fn decode_envelope(src: &mut BytesMut, max_message: usize) -> Result<Option<Bytes>> {
    if src.len() < ENVELOPE_HEADER_SIZE {
        return Ok(None);
    }
    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
    if len > max_message {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: max_message,
        });
    }
    if src.len() < ENVELOPE_HEADER_SIZE + len {
        return Ok(None);
    }

    src.advance(ENVELOPE_HEADER_SIZE);
    Ok(Some(src.split_to(len).freeze()))
}

/// Stream-level limits shared by [`crate::MessageReader`] and [`crate::MessageWriter`].
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Maximum message size in bytes. Default: 16 MiB.
    pub max_message_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
