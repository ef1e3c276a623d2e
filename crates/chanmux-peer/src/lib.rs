//! Connection layer for chanmux.
//!
//! A client connects to a Unix domain socket and sends a connect request
//! naming an action. The server answers, then attaches the connection either
//! as a multiplexer (action `multiplex`) or as a single direct channel handed
//! to whichever handler claims the action. Each attached connection gets one
//! reader thread, the pump.

pub mod connector;
pub mod error;
pub mod handshake;
#[cfg(unix)]
pub mod listener;
pub mod pump;

pub use connector::{connect, connect_multiplexed, connect_with_config, ConnectConfig, Connection};
pub use error::{PeerError, Result};
pub use handshake::{
    handshake_client, handshake_server, ConnectRequest, ConnectResponse, HandshakeConfig,
    HandshakeResult, MULTIPLEX_ACTION,
};
#[cfg(unix)]
pub use listener::{Accepted, Server, ServerConfig};
pub use pump::{pump, spawn_pump};
