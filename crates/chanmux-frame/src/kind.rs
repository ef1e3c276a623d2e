//! Frame kinds.
//!
//! The kind byte is a closed set. Routing only cares whether a frame is
//! control (open/close/error) or carries channel data (data/text).

use crate::error::FrameError;

/// The discriminant carried in byte 0 of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Open a channel. Payload is an encoded [`crate::OpenRequest`].
    Open = 0,
    /// Binary message for a channel.
    Data = 1,
    /// Close a channel. Payload is an encoded [`crate::CloseInfo`].
    Close = 2,
    /// Diagnostic from the peer, UTF-8 text.
    Error = 3,
    /// UTF-8 text message for a channel.
    Text = 4,
}

impl FrameKind {
    /// Returns true for open/close/error frames.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Open | Self::Close | Self::Error)
    }

    /// Returns true for frames that carry a channel message.
    pub fn is_message(self) -> bool {
        matches!(self, Self::Data | Self::Text)
    }

    /// Human-readable name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Data => "DATA",
            Self::Close => "CLOSE",
            Self::Error => "ERROR",
            Self::Text => "TEXT",
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(kind: FrameKind) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(Self::Open),
            1 => Ok(Self::Data),
            2 => Ok(Self::Close),
            3 => Ok(Self::Error),
            4 => Ok(Self::Text),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
