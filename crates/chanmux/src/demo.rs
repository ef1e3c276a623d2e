//! Handlers served by `chanmux serve`.
//!
//! - `ECHO` channels echo every message back unchanged.
//! - `UPPR` channels echo text upper-cased; binary messages are ASCII
//!   upper-cased.
//! - A direct connection with action `echo` behaves like an `ECHO` channel.

use std::sync::Arc;

use chanmux_channel::{
    ChannelContext, CloseEvent, Handler, MessageData, MessageEvent, Mw, MwError, MwFactory,
    MwRegistry, RequestContext, VirtualChannel,
};
use tracing::{debug, info, warn};

pub const ECHO_CODE: &str = "ECHO";
pub const UPPER_CODE: &str = "UPPR";
pub const ECHO_ACTION: &str = "echo";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transform {
    Identity,
    Upper,
}

struct EchoHandler {
    name: &'static str,
    transform: Transform,
}

impl EchoHandler {
    fn reply(
        &self,
        channel: &dyn VirtualChannel,
        data: &MessageData,
    ) -> chanmux_channel::Result<()> {
        match (self.transform, data) {
            (Transform::Identity, MessageData::Text(text)) => channel.send_text(text),
            (Transform::Identity, MessageData::Binary(bytes)) => channel.send(bytes),
            (Transform::Upper, MessageData::Text(text)) => channel.send_text(&text.to_uppercase()),
            (Transform::Upper, MessageData::Binary(bytes)) => {
                channel.send(&bytes.to_ascii_uppercase())
            }
        }
    }
}

impl Handler for EchoHandler {
    fn name(&self) -> &str {
        self.name
    }

    fn on_message(&self, channel: &dyn VirtualChannel, event: &MessageEvent) {
        debug!(
            handler = self.name,
            channel_id = channel.id(),
            size = event.data.len(),
            "echoing message"
        );
        if let Err(err) = self.reply(channel, &event.data) {
            warn!(handler = self.name, error = %err, "echo failed");
        }
    }

    fn on_close(&self, event: &CloseEvent) {
        info!(
            handler = self.name,
            code = event.code,
            clean = event.was_clean,
            "channel finished"
        );
    }
}

/// Claims the demo routing codes and the `echo` action.
pub struct DemoFactory;

impl MwFactory for DemoFactory {
    fn name(&self) -> &str {
        "demo"
    }

    fn process_request(&self, ctx: &RequestContext) -> Result<Option<Arc<Mw>>, MwError> {
        if ctx.request.action != ECHO_ACTION {
            return Ok(None);
        }
        let handler = EchoHandler {
            name: "echo",
            transform: Transform::Identity,
        };
        Ok(Some(Mw::bind(ctx.channel.clone(), Arc::new(handler))))
    }

    fn process_channel(&self, ctx: &ChannelContext) -> Result<Option<Arc<Mw>>, MwError> {
        let handler = match ctx.code.as_str() {
            ECHO_CODE => EchoHandler {
                name: "echo",
                transform: Transform::Identity,
            },
            UPPER_CODE => EchoHandler {
                name: "upper",
                transform: Transform::Upper,
            },
            _ => return Ok(None),
        };
        let mw = Mw::bind(ctx.channel.clone(), Arc::new(handler));
        if let Some(data) = &ctx.data {
            // Initial payload from the open request counts as the first message.
            let event = MessageEvent::new(MessageData::Binary(data.clone()), ctx.channel.id());
            mw.handle_message(&event);
        }
        Ok(Some(mw))
    }
}

pub fn registry() -> Arc<MwRegistry> {
    let registry = Arc::new(MwRegistry::new());
    registry.register(Arc::new(DemoFactory));
    registry
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Capture {
        sent: Mutex<Vec<MessageData>>,
    }

    impl VirtualChannel for Capture {
        fn id(&self) -> u32 {
            9
        }

        fn state(&self) -> chanmux_channel::ChannelState {
            chanmux_channel::ChannelState::Open
        }

        fn send(&self, data: &[u8]) -> chanmux_channel::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push(MessageData::Binary(bytes::Bytes::copy_from_slice(data)));
            Ok(())
        }

        fn send_text(&self, text: &str) -> chanmux_channel::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push(MessageData::Text(text.to_string()));
            Ok(())
        }

        fn close(&self, _code: Option<u16>, _reason: Option<&str>) {}

        fn on_message(&self, _listener: chanmux_channel::MessageListener) {}

        fn on_close(&self, _listener: chanmux_channel::CloseListener) {}
    }

    #[test]
    fn upper_handler_upper_cases_text_and_ascii() {
        let channel = Capture::default();
        let handler = EchoHandler {
            name: "upper",
            transform: Transform::Upper,
        };

        handler.on_message(
            &channel,
            &MessageEvent::new(MessageData::Text("héllo".to_string()), 9),
        );
        handler.on_message(
            &channel,
            &MessageEvent::new(MessageData::Binary(bytes::Bytes::from_static(b"ab\xff")), 9),
        );

        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent[0].as_text(), Some("HÉLLO"));
        assert_eq!(sent[1].as_bytes(), b"AB\xff");
    }

    #[test]
    fn echo_handler_keeps_message_kind() {
        let channel = Capture::default();
        let handler = EchoHandler {
            name: "echo",
            transform: Transform::Identity,
        };

        handler.on_message(&channel, &MessageEvent::new(MessageData::Text("hi".into()), 9));
        handler.on_message(
            &channel,
            &MessageEvent::new(MessageData::Binary(bytes::Bytes::from_static(b"\x01")), 9),
        );

        let sent = channel.sent.lock().unwrap();
        assert!(sent[0].is_text());
        assert!(!sent[1].is_text());
    }

    #[test]
    fn registry_has_demo_factory() {
        assert_eq!(registry().names(), vec!["demo".to_string()]);
    }
}
