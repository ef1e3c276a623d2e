use std::time::Duration;

use chanmux_channel::ChannelError;
use chanmux_frame::FrameError;
use chanmux_transport::TransportError;

/// Failures while connecting, handshaking or attaching a connection.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("physical stream: {0}")]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The connect request was malformed, incompatible or refused.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The socket closed before the handshake finished.
    #[error("peer hung up during handshake: {0}")]
    Disconnected(String),

    #[error("malformed handshake json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no handshake reply within {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, PeerError>;
