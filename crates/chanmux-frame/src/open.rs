//! Open-channel payload.
//!
//! ```text
//! bytes 0-1 : code length (u16 LE), 1..=255
//! bytes 2.. : routing code (UTF-8)
//! remainder : initial payload, absent when empty
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Longest routing code accepted in an open request.
pub const MAX_CODE_LEN: usize = 255;

/// Decoded open payload: which handler to route to, plus optional first bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub code: String,
    pub data: Option<Bytes>,
}

/// Encode an open payload.
pub fn encode_open_request(code: &str, data: Option<&[u8]>) -> Result<Bytes> {
    validate_code_len(code.len())?;
    let data = data.unwrap_or_default();

    let mut dst = BytesMut::with_capacity(2 + code.len() + data.len());
    dst.put_u16_le(code.len() as u16);
    dst.put_slice(code.as_bytes());
    dst.put_slice(data);
    Ok(dst.freeze())
}

/// Decode an open payload. The initial data is a slice of `src`.
pub fn decode_open_request(src: Bytes) -> Result<OpenRequest> {
    if src.len() < 2 {
        return Err(FrameError::MalformedOpenRequest(format!(
            "{} bytes, code length needs 2",
            src.len()
        )));
    }

    let code_len = u16::from_le_bytes([src[0], src[1]]) as usize;
    validate_code_len(code_len)?;
    if 2 + code_len > src.len() {
        return Err(FrameError::MalformedOpenRequest(format!(
            "code length {code_len} exceeds remaining {} bytes",
            src.len() - 2
        )));
    }

    let code = std::str::from_utf8(&src[2..2 + code_len])
        .map_err(|err| FrameError::MalformedOpenRequest(format!("code is not UTF-8: {err}")))?
        .to_owned();
    let rest = src.slice(2 + code_len..);
    let data = (!rest.is_empty()).then_some(rest);

    Ok(OpenRequest { code, data })
}

fn validate_code_len(len: usize) -> Result<()> {
    if len == 0 || len > MAX_CODE_LEN {
        return Err(FrameError::MalformedOpenRequest(format!(
            "routing code length {len} outside 1..={MAX_CODE_LEN}"
        )));
    }
    Ok(())
}
