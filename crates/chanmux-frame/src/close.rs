//! Close-channel payload.
//!
//! ```text
//! bytes 0-1  : code (u16 LE)
//! [bytes 2-5 : reason length (u32 LE)]   only if a reason follows
//! [bytes 6.. : reason (UTF-8)]
//! ```
//!
//! An empty payload means "no code".

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

pub const NORMAL_CLOSURE: u16 = 1000;
pub const GOING_AWAY: u16 = 1001;
pub const PROTOCOL_ERROR: u16 = 1002;
/// Reported when a close carried no code. Never sent on the wire.
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// Reported when the physical connection died without a close. Never sent on the wire.
pub const ABNORMAL_CLOSURE: u16 = 1006;
pub const POLICY_VIOLATION: u16 = 1008;
pub const INTERNAL_ERROR: u16 = 1011;

/// Decoded close payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: Option<u16>,
    pub reason: Option<String>,
}

impl CloseInfo {
    pub fn new(code: u16, reason: Option<&str>) -> Self {
        Self {
            code: Some(code),
            reason: reason.filter(|r| !r.is_empty()).map(str::to_owned),
        }
    }

    /// Close info for a physical connection that went away underneath a channel.
    pub fn abnormal(reason: &str) -> Self {
        Self::new(ABNORMAL_CLOSURE, Some(reason))
    }

    /// A close is clean iff its code is 1000.
    pub fn was_clean(&self) -> bool {
        self.code == Some(NORMAL_CLOSURE)
    }

    /// Encode for a close frame. A missing code encodes as an empty payload.
    pub fn encode(&self) -> Bytes {
        match self.code {
            Some(code) => encode_close_info(code, self.reason.as_deref()),
            None => Bytes::new(),
        }
    }
}

/// Encode a close payload. An empty reason is treated as no reason.
pub fn encode_close_info(code: u16, reason: Option<&str>) -> Bytes {
    let reason = reason.unwrap_or_default().as_bytes();
    if reason.is_empty() {
        return Bytes::copy_from_slice(&code.to_le_bytes());
    }

    let mut dst = BytesMut::with_capacity(6 + reason.len());
    dst.put_u16_le(code);
    dst.put_u32_le(reason.len() as u32);
    dst.put_slice(reason);
    dst.freeze()
}

/// Decode a close payload.
pub fn decode_close_info(src: &[u8]) -> Result<CloseInfo> {
    match src.len() {
        0 => return Ok(CloseInfo::default()),
        1 => {
            return Err(FrameError::MalformedCloseInfo(
                "1 byte, code needs 2".to_string(),
            ))
        }
        2 => {
            return Ok(CloseInfo {
                code: Some(u16::from_le_bytes([src[0], src[1]])),
                reason: None,
            })
        }
        3..=5 => {
            return Err(FrameError::MalformedCloseInfo(format!(
                "{} bytes, reason length needs 6",
                src.len()
            )))
        }
        _ => {}
    }

    let code = u16::from_le_bytes([src[0], src[1]]);
    let reason_len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
    let body = &src[6..];

    // Some encoders always write the length field; a zero length with nothing
    // after it is "no reason".
    if reason_len == 0 && body.is_empty() {
        return Ok(CloseInfo {
            code: Some(code),
            reason: None,
        });
    }
    if reason_len == 0 {
        return Err(FrameError::MalformedCloseInfo(format!(
            "zero reason length followed by {} bytes",
            body.len()
        )));
    }
    if reason_len > body.len() {
        return Err(FrameError::MalformedCloseInfo(format!(
            "reason length {reason_len} exceeds remaining {} bytes",
            body.len()
        )));
    }
    if reason_len < body.len() {
        return Err(FrameError::MalformedCloseInfo(format!(
            "{} trailing bytes after reason",
            body.len() - reason_len
        )));
    }

    let reason = std::str::from_utf8(body)
        .map_err(|err| FrameError::MalformedCloseInfo(format!("reason is not UTF-8: {err}")))?;

    Ok(CloseInfo {
        code: Some(code),
        reason: Some(reason.to_owned()),
    })
}
