use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chanmux_frame::CloseInfo;
use tracing::{debug, error, trace};

use crate::error::{ChannelError, Result};
use crate::event::{CloseEvent, MessageData, MessageEvent};

/// Lifecycle of a virtual channel. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ChannelState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub type MessageListener = Arc<dyn Fn(&MessageEvent) + Send + Sync>;
pub type CloseListener = Arc<dyn Fn(&CloseEvent) + Send + Sync>;

/// A socket-shaped conversation. Implemented by [`crate::DirectChannel`]
/// (the physical socket itself) and [`crate::MuxChannel`] (one id on a
/// [`crate::Multiplexer`]); handlers cannot tell them apart.
pub trait VirtualChannel: Send + Sync {
    /// Channel id. Always 0 for a direct channel.
    fn id(&self) -> u32;

    fn state(&self) -> ChannelState;

    /// Send a binary message. Fails with `ChannelClosed` unless the channel is open.
    fn send(&self, data: &[u8]) -> Result<()>;

    /// Send a text message. Same contract as [`VirtualChannel::send`].
    fn send_text(&self, text: &str) -> Result<()>;

    /// Close the channel. Only the first call has any effect.
    fn close(&self, code: Option<u16>, reason: Option<&str>);

    /// Subscribe to inbound messages. Messages that arrived before the first
    /// listener was registered are delivered to it first, in order.
    fn on_message(&self, listener: MessageListener);

    /// Subscribe to the close event. Fires exactly once, immediately if the
    /// channel has already closed.
    fn on_close(&self, listener: CloseListener);
}

/// State machine and listener bookkeeping shared by every channel variant.
///
/// Listeners are always invoked with the internal lock released, so they may
/// call back into the channel (send, close, subscribe). A panicking listener
/// is logged and skipped; it never unwinds into the read path.
pub struct ChannelCore {
    id: u32,
    inner: Mutex<CoreInner>,
}

struct CoreInner {
    state: ChannelState,
    message_listeners: Vec<MessageListener>,
    pending: VecDeque<MessageEvent>,
    flushing: bool,
    close_listeners: Vec<CloseListener>,
    close_event: Option<Arc<CloseEvent>>,
}

impl ChannelCore {
    pub fn new(id: u32, state: ChannelState) -> Self {
        Self {
            id,
            inner: Mutex::new(CoreInner {
                state,
                message_listeners: Vec::new(),
                pending: VecDeque::new(),
                flushing: false,
                close_listeners: Vec::new(),
                close_event: None,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        self.lock().state
    }

    /// `Connecting -> Open`. Returns false from any other state.
    pub fn mark_open(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != ChannelState::Connecting {
            return false;
        }
        inner.state = ChannelState::Open;
        true
    }

    /// Fails with `ChannelClosed` unless the channel is `Open`.
    pub fn ensure_open(&self) -> Result<()> {
        if self.state() == ChannelState::Open {
            Ok(())
        } else {
            Err(ChannelError::ChannelClosed { id: self.id })
        }
    }

    /// `Open | Connecting -> Closing`. Returns true only for the caller that
    /// made the transition; that caller owns the rest of the teardown.
    pub fn begin_close(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            ChannelState::Connecting | ChannelState::Open => {
                inner.state = ChannelState::Closing;
                true
            }
            ChannelState::Closing | ChannelState::Closed => false,
        }
    }

    /// Move to `Closed` and fire the close listeners with `info`.
    ///
    /// Returns false if the channel was already closed. Message listeners and
    /// buffered messages are dropped here, which also releases whatever the
    /// listeners captured.
    pub fn finish_close(&self, info: &CloseInfo) -> bool {
        let (event, listeners) = {
            let mut inner = self.lock();
            if inner.state == ChannelState::Closed {
                return false;
            }
            inner.state = ChannelState::Closed;

            let event = Arc::new(CloseEvent::from_info(info, self.id));
            inner.close_event = Some(Arc::clone(&event));
            inner.message_listeners.clear();
            inner.pending.clear();
            (event, std::mem::take(&mut inner.close_listeners))
        };

        debug!(
            channel_id = self.id,
            code = event.code,
            clean = event.was_clean,
            "channel closed"
        );
        for listener in listeners {
            self.guarded("close", || listener(&event));
        }
        true
    }

    /// Hand an inbound message to the listeners, or buffer it until one exists.
    pub fn deliver(&self, data: MessageData) {
        let event = MessageEvent::new(data, self.id);
        let listeners = {
            let mut inner = self.lock();
            if inner.state == ChannelState::Closed {
                trace!(channel_id = self.id, "dropping message for closed channel");
                return;
            }
            if inner.message_listeners.is_empty() || inner.flushing {
                inner.pending.push_back(event);
                return;
            }
            inner.message_listeners.clone()
        };

        for listener in &listeners {
            self.guarded("message", || listener(&event));
        }
    }

    pub fn add_message_listener(&self, listener: MessageListener) {
        let mut batch = {
            let mut inner = self.lock();
            if inner.state == ChannelState::Closed {
                return;
            }
            inner.message_listeners.push(Arc::clone(&listener));
            if inner.message_listeners.len() > 1 || inner.pending.is_empty() || inner.flushing {
                return;
            }
            inner.flushing = true;
            std::mem::take(&mut inner.pending)
        };
        // The backlog belongs to the first listener alone.
        let mut targets = vec![listener];

        // Messages delivered while we flush land in `pending`; drain until quiet
        // and hand each later batch to everyone subscribed by then.
        loop {
            for event in &batch {
                for target in &targets {
                    self.guarded("message", || target(event));
                }
            }
            let mut inner = self.lock();
            if inner.pending.is_empty() || inner.state == ChannelState::Closed {
                inner.flushing = false;
                return;
            }
            batch = std::mem::take(&mut inner.pending);
            targets = inner.message_listeners.clone();
        }
    }

    pub fn add_close_listener(&self, listener: CloseListener) {
        let closed = {
            let mut inner = self.lock();
            match &inner.close_event {
                Some(event) => Arc::clone(event),
                None => {
                    inner.close_listeners.push(listener);
                    return;
                }
            }
        };
        self.guarded("close", || listener(&closed));
    }

    /// Number of messages waiting for a first listener.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    fn lock(&self) -> MutexGuard<'_, CoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn guarded(&self, kind: &'static str, call: impl FnOnce()) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(call)) {
            error!(
                channel_id = self.id,
                listener = kind,
                panic = panic_message(panic.as_ref()),
                "channel listener panicked"
            );
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

impl fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCore")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
