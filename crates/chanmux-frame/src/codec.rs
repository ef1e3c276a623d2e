use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::kind::FrameKind;

/// Frame header: kind (1) + channel id (4) = 5 bytes.
pub const HEADER_SIZE: usize = 5;

/// Channel id reserved for the physical/control channel.
pub const CONTROL_CHANNEL: u32 = 0;

/// One typed, channel-addressed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub channel_id: u32,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(kind: FrameKind, channel_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            channel_id,
            payload: payload.into(),
        }
    }

    /// The encoded size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode this frame.
    pub fn encode(&self) -> Bytes {
        encode_frame(self.kind, self.channel_id, &self.payload)
    }
}

/// Encode a frame into exactly `5 + payload.len()` bytes.
///
/// ```text
/// ┌──────────┬──────────────┬──────────────────┐
/// │ Kind     │ Channel id   │ Payload          │
/// │ (1B)     │ (4B LE)      │ (rest)           │
/// └──────────┴──────────────┴──────────────────┘
/// ```
pub fn encode_frame(kind: FrameKind, channel_id: u32, payload: &[u8]) -> Bytes {
    let mut dst = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    dst.put_u8(kind.into());
    dst.put_u32_le(channel_id);
    dst.put_slice(payload);
    dst.freeze()
}

/// Decode one frame. The payload is a slice of `src`.
pub fn decode_frame(src: Bytes) -> Result<Frame> {
    if src.len() < HEADER_SIZE {
        return Err(FrameError::MalformedFrame { len: src.len() });
    }

    let kind = FrameKind::try_from(src[0])?;
    let channel_id = u32::from_le_bytes([src[1], src[2], src[3], src[4]]);
    let payload = src.slice(HEADER_SIZE..);

    Ok(Frame {
        kind,
        channel_id,
        payload,
    })
}
