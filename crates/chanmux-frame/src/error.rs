/// Errors raised while encoding or decoding wire data.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The buffer is too short to hold a frame header.
    #[error("malformed frame ({len} bytes, need at least 5)")]
    MalformedFrame { len: usize },

    /// The frame kind byte is not one this codec assigns.
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),

    /// A close payload violates the close-info layout.
    #[error("malformed close info: {0}")]
    MalformedCloseInfo(String),

    /// An open payload violates the open-request layout.
    #[error("malformed open request: {0}")]
    MalformedOpenRequest(String),

    /// The envelope header contains an invalid magic number.
    #[error("invalid envelope magic (expected 0x434d \"CM\")")]
    InvalidMagic,

    /// The message exceeds the configured maximum size.
    #[error("message too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing envelopes.
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended, either between envelopes or inside one.
    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;

impl From<chanmux_transport::TransportError> for FrameError {
    fn from(err: chanmux_transport::TransportError) -> Self {
        match err.into_io() {
            Ok(io) => FrameError::Io(io),
            Err(other) => FrameError::Io(std::io::Error::other(other.to_string())),
        }
    }
}
