//! Physical socket transport for chanmux.
//!
//! A chanmux connection rides on exactly one bidirectional byte stream. This
//! crate provides that stream ([`IpcStream`]) and the listener/connector used
//! to establish it. Everything above this layer (envelopes, frames, channels)
//! only needs `Read + Write` plus shutdown.

pub mod error;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use traits::{IpcStream, PeerCredentials};

#[cfg(unix)]
pub use uds::UnixDomainSocket;
