//! Virtual channels for chanmux.
//!
//! A [`VirtualChannel`] is a socket-shaped conversation: state, send, close,
//! and message/close subscriptions. Two variants sit behind that one trait:
//!
//! - [`DirectChannel`]: the physical connection itself, used when a peer asked
//!   for a single conversation.
//! - [`MuxChannel`]: one channel id on a [`Multiplexer`], which owns the
//!   physical socket, allocates ids and routes frames.
//!
//! Handlers are attached through the [`MwRegistry`], which binds each handler's
//! lifetime to the channel it serves.

pub mod channel;
pub mod direct;
pub mod error;
pub mod event;
pub mod middleware;
pub mod mux;
pub mod socket;

pub use channel::{ChannelCore, ChannelState, CloseListener, MessageListener, VirtualChannel};
pub use direct::DirectChannel;
pub use error::{ChannelError, MwError, Result};
pub use event::{CloseEvent, Event, EventInit, MessageData, MessageEvent};
pub use middleware::{
    ChannelContext, DispatchContext, Handler, Mw, MwFactory, MwRegistry, RequestContext,
    RequestParameters,
};
pub use mux::{Multiplexer, MuxChannel, MuxConfig, Role};
pub use socket::{FrameSink, PhysicalSocket, StreamSocket};
