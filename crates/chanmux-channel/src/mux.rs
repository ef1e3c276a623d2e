use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use chanmux_frame::{
    decode_close_info, decode_frame, decode_open_request, encode_close_info, encode_frame,
    encode_open_request, CloseInfo, Frame, FrameKind, CONTROL_CHANNEL, POLICY_VIOLATION,
};
use tracing::{debug, info, warn};

use crate::channel::{ChannelCore, ChannelState, CloseListener, MessageListener, VirtualChannel};
use crate::error::{ChannelError, Result};
use crate::event::MessageData;
use crate::middleware::{ChannelContext, MwRegistry};
use crate::socket::{FrameSink, PhysicalSocket};

/// Which side of the connection this multiplexer is. Decides id parity so
/// both sides can open channels without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Allocates odd ids: 1, 3, 5, ...
    Client,
    /// Allocates even ids: 2, 4, 6, ...
    Server,
}

impl Role {
    fn first_id(self) -> u32 {
        match self {
            Self::Client => 1,
            Self::Server => 2,
        }
    }
}

/// Multiplexer behavior.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub role: Role,
    /// Channels tracked at once, counting both locally and remotely opened.
    pub max_channels: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            role: Role::Client,
            max_channels: 1024,
        }
    }
}

impl MuxConfig {
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_max_channels(mut self, max_channels: usize) -> Self {
        self.max_channels = max_channels;
        self
    }
}

/// Owns one physical socket and carries many [`MuxChannel`]s over it.
///
/// Inbound traffic arrives through [`FrameSink`], one message at a time from
/// the connection's read loop. Outbound frames from any thread go straight to
/// the socket, which serializes them.
pub struct Multiplexer {
    socket: Arc<dyn PhysicalSocket>,
    table: Mutex<ChannelTable>,
    registry: Arc<MwRegistry>,
    config: MuxConfig,
    this: Weak<Multiplexer>,
}

struct ChannelTable {
    channels: HashMap<u32, Arc<MuxChannel>>,
    next_id: u32,
    closed: bool,
}

impl ChannelTable {
    /// Next free id of this side's parity. Never 0, never an id in use.
    fn allocate(&mut self, step: u32, first: u32) -> Result<u32> {
        for _ in 0..=self.channels.len() {
            let candidate = self.next_id;
            self.next_id = match self.next_id.wrapping_add(step) {
                CONTROL_CHANNEL => first,
                next => next,
            };
            if candidate != CONTROL_CHANNEL && !self.channels.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(ChannelError::IdsExhausted)
    }
}

impl Multiplexer {
    pub fn new(
        socket: Arc<dyn PhysicalSocket>,
        registry: Arc<MwRegistry>,
        config: MuxConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            socket,
            table: Mutex::new(ChannelTable {
                channels: HashMap::new(),
                next_id: config.role.first_id(),
                closed: false,
            }),
            registry,
            config,
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<MwRegistry> {
        &self.registry
    }

    /// Number of registered channels.
    pub fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn channel(&self, id: u32) -> Option<Arc<MuxChannel>> {
        self.lock().channels.get(&id).cloned()
    }

    /// True once the multiplexer was shut down or lost its socket.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Open a channel routed by `code` on the peer. Returns as soon as the
    /// Open frame is written; the peer's handler attaches asynchronously.
    pub fn open_channel(&self, code: &str, data: Option<&[u8]>) -> Result<Arc<MuxChannel>> {
        let payload = encode_open_request(code, data)?;

        let channel = {
            let mut table = self.lock();
            if table.closed {
                return Err(ChannelError::ChannelClosed {
                    id: CONTROL_CHANNEL,
                });
            }
            if table.channels.len() >= self.config.max_channels {
                return Err(ChannelError::ChannelLimit {
                    max: self.config.max_channels,
                });
            }
            let id = table.allocate(2, self.config.role.first_id())?;
            let channel = Arc::new(MuxChannel::new(
                id,
                ChannelState::Connecting,
                self.this.clone(),
            ));
            table.channels.insert(id, Arc::clone(&channel));
            channel
        };

        self.write_frame(FrameKind::Open, channel.id(), &payload)?;
        channel.core.mark_open();
        debug!(channel_id = channel.id(), code, "channel opened");
        Ok(channel)
    }

    /// Close every channel with `code`, tell the peer the whole connection is
    /// going away, then shut the socket down.
    pub fn close(&self, code: u16, reason: Option<&str>) {
        let channels = {
            let mut table = self.lock();
            if table.closed {
                return;
            }
            table.closed = true;
            drain_sorted(&mut table.channels)
        };

        info!(channels = channels.len(), code, "closing multiplexer");
        for channel in &channels {
            channel.close(Some(code), reason);
        }

        let message = encode_frame(
            FrameKind::Close,
            CONTROL_CHANNEL,
            &encode_close_info(code, reason),
        );
        if let Err(err) = self.socket.send_message(&message) {
            debug!(error = %err, "connection close frame not delivered");
        }
        self.socket.shutdown();
    }

    /// Write one frame. A failure here means the physical socket is gone, so
    /// every channel is torn down before the error is returned.
    fn write_frame(&self, kind: FrameKind, channel_id: u32, payload: &[u8]) -> Result<()> {
        let message = encode_frame(kind, channel_id, payload);
        if let Err(err) = self.socket.send_message(&message) {
            warn!(channel_id, kind = %kind, error = %err, "physical write failed");
            self.on_physical_close();
            return Err(ChannelError::TransportFailure(err.to_string()));
        }
        Ok(())
    }

    fn report_error(&self, channel_id: u32, text: &str) {
        let message = encode_frame(FrameKind::Error, channel_id, text.as_bytes());
        if let Err(err) = self.socket.send_message(&message) {
            debug!(channel_id, error = %err, "error frame not delivered");
        }
    }

    fn unregister(&self, channel_id: u32) -> Option<Arc<MuxChannel>> {
        self.lock().channels.remove(&channel_id)
    }

    fn route_message(&self, frame: Frame) {
        let Some(channel) = self.channel(frame.channel_id) else {
            warn!(
                channel_id = frame.channel_id,
                kind = %frame.kind,
                "dropping message for unknown channel"
            );
            self.report_error(
                frame.channel_id,
                &ChannelError::UnknownChannel(frame.channel_id).to_string(),
            );
            return;
        };

        let data = match frame.kind {
            FrameKind::Text => match String::from_utf8(frame.payload.to_vec()) {
                Ok(text) => MessageData::Text(text),
                Err(err) => {
                    warn!(
                        channel_id = frame.channel_id,
                        error = %err,
                        "dropping text frame with invalid UTF-8"
                    );
                    return;
                }
            },
            _ => MessageData::Binary(frame.payload),
        };
        channel.core.deliver(data);
    }

    fn route_close(&self, channel_id: u32, payload: &[u8]) {
        let info = match decode_close_info(payload) {
            Ok(info) => info,
            Err(err) => {
                warn!(channel_id, error = %err, "dropping close frame");
                return;
            }
        };
        let Some(channel) = self.unregister(channel_id) else {
            debug!(channel_id, "close for unknown channel");
            return;
        };

        debug!(channel_id, code = ?info.code, "peer closed channel");
        channel.core.begin_close();
        channel.core.finish_close(&info);
    }

    fn accept_open(&self, channel_id: u32, payload: Bytes) {
        if channel_id == CONTROL_CHANNEL {
            warn!("dropping open frame for the control channel");
            self.report_error(channel_id, "channel 0 is reserved");
            return;
        }
        let request = match decode_open_request(payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(channel_id, error = %err, "dropping open frame");
                self.report_error(channel_id, &err.to_string());
                return;
            }
        };
        let Some(multiplexer) = self.this.upgrade() else {
            return;
        };

        let channel = {
            let mut table = self.lock();
            if table.closed {
                return;
            }
            if table.channels.contains_key(&channel_id) {
                drop(table);
                warn!(channel_id, "dropping open frame for an id already in use");
                self.report_error(channel_id, &format!("channel {channel_id} already open"));
                return;
            }
            if table.channels.len() >= self.config.max_channels {
                drop(table);
                warn!(
                    channel_id,
                    max = self.config.max_channels,
                    "refusing channel over limit"
                );
                let info = encode_close_info(POLICY_VIOLATION, Some("channel limit reached"));
                if let Err(err) = self.write_frame(FrameKind::Close, channel_id, &info) {
                    debug!(channel_id, error = %err, "refusal not delivered");
                }
                return;
            }
            let channel = Arc::new(MuxChannel::new(
                channel_id,
                ChannelState::Open,
                self.this.clone(),
            ));
            table.channels.insert(channel_id, Arc::clone(&channel));
            channel
        };

        debug!(channel_id, code = %request.code, "peer opened channel");
        let ctx = ChannelContext {
            channel: Arc::clone(&channel),
            multiplexer,
            code: request.code,
            data: request.data,
        };
        if self.registry.dispatch_channel(&ctx).is_none() {
            info!(channel_id, code = %ctx.code, "no handler claimed channel");
            channel.close(Some(POLICY_VIOLATION), Some("no handler for routing code"));
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameSink for Multiplexer {
    fn on_physical_message(&self, message: Bytes) {
        let frame = match decode_frame(message) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "dropping undecodable frame");
                return;
            }
        };

        match frame.kind {
            FrameKind::Open => self.accept_open(frame.channel_id, frame.payload),
            FrameKind::Data | FrameKind::Text => self.route_message(frame),
            FrameKind::Close if frame.channel_id == CONTROL_CHANNEL => {
                info!("peer closed the connection");
                self.on_physical_close();
            }
            FrameKind::Close => self.route_close(frame.channel_id, &frame.payload),
            FrameKind::Error => warn!(
                channel_id = frame.channel_id,
                message = %String::from_utf8_lossy(&frame.payload),
                "peer reported error"
            ),
        }
    }

    fn on_physical_close(&self) {
        let channels = {
            let mut table = self.lock();
            table.closed = true;
            drain_sorted(&mut table.channels)
        };
        if !channels.is_empty() {
            info!(channels = channels.len(), "physical connection lost, closing channels");
        }

        let info = CloseInfo::abnormal("physical connection closed");
        for channel in channels {
            channel.core.begin_close();
            channel.core.finish_close(&info);
        }
        self.socket.shutdown();
    }
}

fn drain_sorted(channels: &mut HashMap<u32, Arc<MuxChannel>>) -> Vec<Arc<MuxChannel>> {
    let mut drained: Vec<_> = channels.drain().collect();
    drained.sort_unstable_by_key(|(id, _)| *id);
    drained.into_iter().map(|(_, channel)| channel).collect()
}

/// One channel id on a [`Multiplexer`].
pub struct MuxChannel {
    core: ChannelCore,
    multiplexer: Weak<Multiplexer>,
}

impl MuxChannel {
    fn new(id: u32, state: ChannelState, multiplexer: Weak<Multiplexer>) -> Self {
        Self {
            core: ChannelCore::new(id, state),
            multiplexer,
        }
    }

    /// The owning multiplexer, if it is still alive.
    pub fn multiplexer(&self) -> Option<Arc<Multiplexer>> {
        self.multiplexer.upgrade()
    }

    fn write(&self, kind: FrameKind, payload: &[u8]) -> Result<()> {
        self.core.ensure_open()?;
        let multiplexer = self.multiplexer().ok_or(ChannelError::ChannelClosed {
            id: self.core.id(),
        })?;
        multiplexer.write_frame(kind, self.core.id(), payload)
    }
}

impl VirtualChannel for MuxChannel {
    fn id(&self) -> u32 {
        self.core.id()
    }

    fn state(&self) -> ChannelState {
        self.core.state()
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        self.write(FrameKind::Data, data)
    }

    fn send_text(&self, text: &str) -> Result<()> {
        self.write(FrameKind::Text, text.as_bytes())
    }

    fn close(&self, code: Option<u16>, reason: Option<&str>) {
        if !self.core.begin_close() {
            return;
        }
        let info = match code {
            Some(code) => CloseInfo::new(code, reason),
            None => CloseInfo::default(),
        };

        if let Some(multiplexer) = self.multiplexer() {
            multiplexer.unregister(self.core.id());
            let sent = multiplexer.write_frame(FrameKind::Close, self.core.id(), &info.encode());
            if let Err(err) = sent {
                debug!(channel_id = self.core.id(), error = %err, "close frame not delivered");
            }
        }
        self.core.finish_close(&info);
    }

    fn on_message(&self, listener: MessageListener) {
        self.core.add_message_listener(listener);
    }

    fn on_close(&self, listener: CloseListener) {
        self.core.add_close_listener(listener);
    }
}
