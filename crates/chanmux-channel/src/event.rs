//! Event values delivered to channel listeners.
//!
//! These mirror the shape of browser socket events so handlers read the same
//! fields whether they sit on a direct socket or a multiplexed channel. There
//! is no event tree here: channels are leaf emitters, so the propagation
//! controls are accepted and ignored.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use chanmux_frame::{CloseInfo, NO_STATUS_RECEIVED};

/// `event_phase()` for an event that has no target.
pub const PHASE_NONE: u16 = 0;
/// `event_phase()` for an event being delivered at its target channel.
pub const PHASE_AT_TARGET: u16 = 2;

/// Flags fixed at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventInit {
    pub bubbles: bool,
    pub cancelable: bool,
    pub composed: bool,
}

/// Generic event.
#[derive(Debug)]
pub struct Event {
    event_type: String,
    init: EventInit,
    default_prevented: AtomicBool,
    time_stamp: u64,
    target: Option<u32>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, target: Option<u32>) -> Self {
        Self::with_init(event_type, EventInit::default(), target)
    }

    pub fn with_init(event_type: impl Into<String>, init: EventInit, target: Option<u32>) -> Self {
        Self {
            event_type: event_type.into(),
            init,
            default_prevented: AtomicBool::new(false),
            time_stamp: now_millis(),
            target,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn bubbles(&self) -> bool {
        self.init.bubbles
    }

    pub fn cancelable(&self) -> bool {
        self.init.cancelable
    }

    pub fn composed(&self) -> bool {
        self.init.composed
    }

    /// Milliseconds since the Unix epoch at construction.
    pub fn time_stamp(&self) -> u64 {
        self.time_stamp
    }

    /// Id of the channel that emitted this event.
    pub fn target(&self) -> Option<u32> {
        self.target
    }

    /// Marks the event as handled. Has no effect unless the event is cancelable.
    pub fn prevent_default(&self) {
        if self.init.cancelable {
            self.default_prevented.store(true, Ordering::Release);
        }
    }

    pub fn default_prevented(&self) -> bool {
        self.default_prevented.load(Ordering::Acquire)
    }

    /// Legacy inverse of [`Event::default_prevented`].
    pub fn return_value(&self) -> bool {
        !self.default_prevented()
    }

    pub fn stop_propagation(&self) {}

    pub fn stop_immediate_propagation(&self) {}

    pub fn composed_path(&self) -> Vec<u32> {
        self.target.into_iter().collect()
    }

    pub fn event_phase(&self) -> u16 {
        if self.target.is_some() {
            PHASE_AT_TARGET
        } else {
            PHASE_NONE
        }
    }
}

/// Body of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageData {
    Binary(Bytes),
    Text(String),
}

impl MessageData {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Binary(bytes) => bytes,
            Self::Text(text) => text.as_bytes(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Binary(_) => None,
            Self::Text(text) => Some(text),
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// A message received on a channel.
#[derive(Debug)]
pub struct MessageEvent {
    event: Event,
    pub data: MessageData,
    pub origin: String,
    pub last_event_id: String,
    /// Id of the channel the message arrived on.
    pub source: Option<u32>,
}

impl MessageEvent {
    pub fn new(data: MessageData, channel_id: u32) -> Self {
        Self {
            event: Event::new("message", Some(channel_id)),
            data,
            origin: String::new(),
            last_event_id: String::new(),
            source: Some(channel_id),
        }
    }

    /// Always empty: channels carry no transferable ports.
    pub fn ports(&self) -> &[u32] {
        &[]
    }
}

impl Deref for MessageEvent {
    type Target = Event;

    fn deref(&self) -> &Event {
        &self.event
    }
}

/// The final event of a channel.
#[derive(Debug)]
pub struct CloseEvent {
    event: Event,
    pub code: u16,
    pub reason: String,
    pub was_clean: bool,
}

impl CloseEvent {
    /// A missing code reports 1005 and a missing reason reports "".
    pub fn from_info(info: &CloseInfo, channel_id: u32) -> Self {
        Self {
            event: Event::new("close", Some(channel_id)),
            code: info.code.unwrap_or(NO_STATUS_RECEIVED),
            reason: info.reason.clone().unwrap_or_default(),
            was_clean: info.was_clean(),
        }
    }
}

impl Deref for CloseEvent {
    type Target = Event;

    fn deref(&self) -> &Event {
        &self.event
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
