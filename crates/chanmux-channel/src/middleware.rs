//! Middleware dispatch: picking a protocol handler for a connection or channel.
//!
//! A [`MwRegistry`] holds factories in registration order. For every inbound
//! direct connection ([`RequestContext`]) or peer-opened channel
//! ([`ChannelContext`]) the factories are asked in turn; the first one that
//! returns a handler wins. Factory and handler failures never escape this
//! module: they are logged and the affected channel is closed with 1011.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use chanmux_frame::{INTERNAL_ERROR, NORMAL_CLOSURE};
use chanmux_transport::PeerCredentials;
use tracing::{debug, error, warn};

use crate::channel::{panic_message, ChannelState, VirtualChannel};
use crate::direct::DirectChannel;
use crate::error::MwError;
use crate::event::{CloseEvent, MessageEvent};
use crate::mux::{Multiplexer, MuxChannel};

/// Metadata of an inbound physical connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParameters {
    pub connection_id: u64,
    /// Routing action chosen by the client.
    pub action: String,
    pub params: BTreeMap<String, String>,
    pub peer_credentials: Option<PeerCredentials>,
}

/// A direct (non-multiplexed) connection awaiting a handler.
pub struct RequestContext {
    pub channel: Arc<DirectChannel>,
    pub request: RequestParameters,
}

/// A channel the peer just opened on a multiplexer.
pub struct ChannelContext {
    pub channel: Arc<MuxChannel>,
    pub multiplexer: Arc<Multiplexer>,
    /// Routing code from the open request.
    pub code: String,
    /// Initial payload from the open request.
    pub data: Option<Bytes>,
}

#[derive(Clone, Copy)]
pub enum DispatchContext<'a> {
    Request(&'a RequestContext),
    Channel(&'a ChannelContext),
}

impl DispatchContext<'_> {
    pub fn channel(&self) -> Arc<dyn VirtualChannel> {
        match self {
            Self::Request(ctx) => ctx.channel.clone(),
            Self::Channel(ctx) => ctx.channel.clone(),
        }
    }

    /// The action (direct) or routing code (channel) being dispatched.
    pub fn route(&self) -> &str {
        match self {
            Self::Request(ctx) => &ctx.request.action,
            Self::Channel(ctx) => &ctx.code,
        }
    }
}

/// Builds handlers. Both entry points default to "not mine".
pub trait MwFactory: Send + Sync {
    fn name(&self) -> &str;

    fn process_request(&self, _ctx: &RequestContext) -> Result<Option<Arc<Mw>>, MwError> {
        Ok(None)
    }

    fn process_channel(&self, _ctx: &ChannelContext) -> Result<Option<Arc<Mw>>, MwError> {
        Ok(None)
    }
}

/// Protocol logic bound to one channel.
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    fn on_message(&self, channel: &dyn VirtualChannel, event: &MessageEvent);

    fn on_close(&self, _event: &CloseEvent) {}

    /// Teardown. Runs at most once per binding.
    fn release(&self) -> Result<(), MwError> {
        Ok(())
    }
}

/// A handler bound to its channel.
///
/// The channel's listeners own the binding, so it lives exactly as long as the
/// channel stays open.
pub struct Mw {
    channel: Arc<dyn VirtualChannel>,
    handler: Arc<dyn Handler>,
    released: AtomicBool,
}

impl Mw {
    /// Subscribe `handler` to `channel` and tie its release to the channel's close.
    pub fn bind(channel: Arc<dyn VirtualChannel>, handler: Arc<dyn Handler>) -> Arc<Self> {
        let mw = Arc::new(Self {
            channel: Arc::clone(&channel),
            handler,
            released: AtomicBool::new(false),
        });

        let on_message = Arc::clone(&mw);
        channel.on_message(Arc::new(move |event: &MessageEvent| {
            on_message.handle_message(event);
        }));
        let on_close = Arc::clone(&mw);
        channel.on_close(Arc::new(move |event: &CloseEvent| {
            on_close.handle_close(event);
        }));

        mw
    }

    pub fn channel(&self) -> &Arc<dyn VirtualChannel> {
        &self.channel
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Tear the handler down and close its channel if it is still open.
    /// Safe to call any number of times; failures are logged, not returned.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        let name = self.handler.name();
        match catch_unwind(AssertUnwindSafe(|| self.handler.release())) {
            Ok(Ok(())) => debug!(
                handler = name,
                channel_id = self.channel.id(),
                "handler released"
            ),
            Ok(Err(err)) => warn!(handler = name, error = %err, "handler release failed"),
            Err(panic) => error!(
                handler = name,
                panic = panic_message(panic.as_ref()),
                "handler panicked during release"
            ),
        }

        if matches!(
            self.channel.state(),
            ChannelState::Connecting | ChannelState::Open
        ) {
            self.channel.close(Some(NORMAL_CLOSURE), None);
        }
    }

    /// Run the handler on one message. A panic is logged and closes the
    /// channel with 1011.
    pub fn handle_message(&self, event: &MessageEvent) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.handler.on_message(self.channel.as_ref(), event)
        }));
        if let Err(panic) = outcome {
            error!(
                handler = self.handler.name(),
                channel_id = self.channel.id(),
                panic = panic_message(panic.as_ref()),
                "handler panicked on message"
            );
            self.channel.close(Some(INTERNAL_ERROR), Some("handler failure"));
        }
    }

    fn handle_close(&self, event: &CloseEvent) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.handler.on_close(event)));
        if let Err(panic) = outcome {
            error!(
                handler = self.handler.name(),
                panic = panic_message(panic.as_ref()),
                "handler panicked on close"
            );
        }
        self.release();
    }
}

impl fmt::Debug for Mw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mw")
            .field("handler", &self.handler.name())
            .field("channel_id", &self.channel.id())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Ordered list of handler factories.
#[derive(Default)]
pub struct MwRegistry {
    factories: RwLock<Vec<Arc<dyn MwFactory>>>,
}

impl MwRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a factory. Earlier registrations take precedence.
    pub fn register(&self, factory: Arc<dyn MwFactory>) {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(factory);
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|factory| factory.name().to_string())
            .collect()
    }

    /// Ask each factory in order; the first handler returned wins.
    ///
    /// `None` means nothing claimed the context, or a factory failed. In the
    /// failure case the channel has already been closed with 1011.
    pub fn dispatch(&self, ctx: DispatchContext<'_>) -> Option<Arc<Mw>> {
        for factory in self.snapshot() {
            let outcome = catch_unwind(AssertUnwindSafe(|| match ctx {
                DispatchContext::Request(request) => factory.process_request(request),
                DispatchContext::Channel(channel) => factory.process_channel(channel),
            }));

            match outcome {
                Ok(Ok(Some(mw))) => {
                    debug!(factory = factory.name(), route = ctx.route(), "handler attached");
                    return Some(mw);
                }
                Ok(Ok(None)) => continue,
                Ok(Err(err)) => {
                    warn!(
                        factory = factory.name(),
                        route = ctx.route(),
                        error = %err,
                        "handler construction failed"
                    );
                }
                Err(panic) => {
                    error!(
                        factory = factory.name(),
                        route = ctx.route(),
                        panic = panic_message(panic.as_ref()),
                        "factory panicked"
                    );
                }
            }
            ctx.channel()
                .close(Some(INTERNAL_ERROR), Some("handler construction failed"));
            return None;
        }
        None
    }

    pub fn dispatch_request(&self, ctx: &RequestContext) -> Option<Arc<Mw>> {
        self.dispatch(DispatchContext::Request(ctx))
    }

    pub fn dispatch_channel(&self, ctx: &ChannelContext) -> Option<Arc<Mw>> {
        self.dispatch(DispatchContext::Channel(ctx))
    }

    fn snapshot(&self) -> Vec<Arc<dyn MwFactory>> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl fmt::Debug for MwRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MwRegistry")
            .field("factories", &self.names())
            .finish()
    }
}
