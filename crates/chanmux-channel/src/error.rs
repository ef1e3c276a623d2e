use chanmux_frame::FrameError;

/// Errors surfaced to callers of a virtual channel or the multiplexer.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel (or the multiplexer, for id 0) is not open.
    #[error("channel {id} is closed")]
    ChannelClosed { id: u32 },

    /// No channel with this id is registered.
    #[error("unknown channel {0}")]
    UnknownChannel(u32),

    /// The multiplexer already tracks its configured maximum of channels.
    #[error("channel limit reached ({max} open)")]
    ChannelLimit { max: usize },

    /// Every id of this side's parity is in use.
    #[error("no free channel ids")]
    IdsExhausted,

    /// The physical socket failed; every channel on it has been closed.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// Encoding failed before anything was written.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Errors raised by protocol handlers during construction or teardown.
#[derive(Debug, thiserror::Error)]
pub enum MwError {
    #[error("handler construction failed: {0}")]
    Construction(String),

    #[error("handler release failed: {0}")]
    Release(String),
}

pub type Result<T> = std::result::Result<T, ChannelError>;
