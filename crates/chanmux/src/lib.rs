//! Virtual channels multiplexed over one local socket.
//!
//! chanmux lets one physical connection carry many independent, socket-shaped
//! conversations, and attaches a protocol handler to each of them by routing
//! code.
//!
//! # Crate Structure
//!
//! - [`transport`]: the physical socket (Unix domain sockets)
//! - [`frame`]: frame, close-info and envelope codecs
//! - [`channel`]: virtual channels, the multiplexer and middleware dispatch
//! - [`peer`]: connect handshake, server and connector (behind `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use chanmux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use chanmux_frame::*;
}

/// Re-export channel, multiplexer and middleware types.
pub mod channel {
    pub use chanmux_channel::*;
}

/// Re-export connection types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use chanmux_peer::*;
}
