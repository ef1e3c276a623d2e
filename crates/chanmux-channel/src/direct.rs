use std::sync::Arc;

use bytes::Bytes;
use chanmux_frame::{
    decode_close_info, decode_frame, encode_frame, CloseInfo, FrameKind, CONTROL_CHANNEL,
};
use tracing::{debug, warn};

use crate::channel::{ChannelCore, ChannelState, CloseListener, MessageListener, VirtualChannel};
use crate::error::{ChannelError, Result};
use crate::event::MessageData;
use crate::socket::{FrameSink, PhysicalSocket};

/// The physical socket itself, seen as a single channel with id 0.
///
/// Messages travel as `Data`/`Text` frames on the control id. Open frames are
/// not meaningful here and are dropped.
pub struct DirectChannel {
    core: ChannelCore,
    socket: Arc<dyn PhysicalSocket>,
}

impl DirectChannel {
    /// Wrap a connected socket. The channel starts `Open`.
    pub fn new(socket: Arc<dyn PhysicalSocket>) -> Arc<Self> {
        Arc::new(Self {
            core: ChannelCore::new(CONTROL_CHANNEL, ChannelState::Open),
            socket,
        })
    }

    fn write(&self, kind: FrameKind, payload: &[u8]) -> Result<()> {
        self.core.ensure_open()?;
        let message = encode_frame(kind, CONTROL_CHANNEL, payload);
        if let Err(err) = self.socket.send_message(&message) {
            warn!(error = %err, "direct channel write failed");
            self.socket.shutdown();
            self.core.begin_close();
            self.core.finish_close(&CloseInfo::abnormal("physical write failed"));
            return Err(ChannelError::TransportFailure(err.to_string()));
        }
        Ok(())
    }
}

impl VirtualChannel for DirectChannel {
    fn id(&self) -> u32 {
        CONTROL_CHANNEL
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

        let message = encode_frame(FrameKind::Close, CONTROL_CHANNEL, &info.encode());
        if let Err(err) = self.socket.send_message(&message) {
            debug!(error = %err, "close frame not delivered");
        }
        self.socket.shutdown();
        self.core.finish_close(&info);
    }

    fn on_message(&self, listener: MessageListener) {
        self.core.add_message_listener(listener);
    }

    fn on_close(&self, listener: CloseListener) {
        self.core.add_close_listener(listener);
    }
}

impl FrameSink for DirectChannel {
    fn on_physical_message(&self, message: Bytes) {
        let frame = match decode_frame(message) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "dropping undecodable frame");
                return;
            }
        };
        if frame.channel_id != CONTROL_CHANNEL {
            warn!(
                channel_id = frame.channel_id,
                kind = %frame.kind,
                "dropping frame addressed to a sub-channel on a direct connection"
            );
            return;
        }

        match frame.kind {
            FrameKind::Data => self.core.deliver(MessageData::Binary(frame.payload)),
            FrameKind::Text => match String::from_utf8(frame.payload.to_vec()) {
                Ok(text) => self.core.deliver(MessageData::Text(text)),
                Err(err) => warn!(error = %err, "dropping text frame with invalid UTF-8"),
            },
            FrameKind::Close => match decode_close_info(&frame.payload) {
                Ok(info) => {
                    debug!(code = ?info.code, "peer closed direct channel");
                    self.core.begin_close();
                    self.socket.shutdown();
                    self.core.finish_close(&info);
                }
                Err(err) => warn!(error = %err, "dropping close frame"),
            },
            FrameKind::Error => warn!(
                message = %String::from_utf8_lossy(&frame.payload),
                "peer reported error"
            ),
            FrameKind::Open => warn!("dropping open frame on a direct connection"),
        }
    }

    fn on_physical_close(&self) {
        self.core.begin_close();
        self.core.finish_close(&CloseInfo::abnormal("physical connection closed"));
    }
}
