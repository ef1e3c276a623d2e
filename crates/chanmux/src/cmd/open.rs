use std::fs;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chanmux_channel::{
    CloseEvent, MessageData, MessageEvent, MuxChannel, MwRegistry, VirtualChannel,
};
use chanmux_frame::NORMAL_CLOSURE;
use chanmux_peer::connect_multiplexed;
use tracing::debug;

use crate::cmd::{parse_duration, OpenArgs};
use crate::exit::{
    channel_error, io_error, peer_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT,
};
use crate::output::{print_reply, OutputFormat, Reply};

enum Payload {
    Binary(Vec<u8>),
    Text(String),
}

enum Outcome {
    Message(MessageData),
    Closed { code: u16, reason: String },
}

pub fn run(args: OpenArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let payload = resolve_payload(&args)?;

    let mux = connect_multiplexed(&args.path, Arc::new(MwRegistry::new()))
        .map_err(|err| peer_error("connect failed", err))?;
    let channel = mux
        .open_channel(&args.code, None)
        .map_err(|err| channel_error("open failed", err))?;
    debug!(channel_id = channel.id(), code = %args.code, "channel opened");

    let outcomes = args.wait.then(|| subscribe(&channel));

    let sent = match &payload {
        Payload::Binary(bytes) => channel.send(bytes),
        Payload::Text(text) => channel.send_text(text),
    };
    if let Err(err) = sent {
        mux.close(NORMAL_CLOSURE, None);
        return Err(channel_error("send failed", err));
    }

    let result = match outcomes {
        Some(outcomes) => wait_for_reply(&outcomes, wait_timeout).map(|data| {
            let reply = Reply {
                channel_id: channel.id(),
                code: &args.code,
                data: &data,
            };
            print_reply(&reply, format);
        }),
        None => Ok(()),
    };

    mux.close(NORMAL_CLOSURE, None);
    result.map(|()| SUCCESS)
}

fn resolve_payload(args: &OpenArgs) -> CliResult<Payload> {
    if let Some(text) = &args.text {
        return Ok(Payload::Text(text.clone()));
    }
    if let Some(data) = &args.data {
        return Ok(Payload::Binary(data.as_bytes().to_vec()));
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map(Payload::Binary)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Payload::Binary(Vec::new()))
}

fn subscribe(channel: &MuxChannel) -> mpsc::Receiver<Outcome> {
    let (tx, rx) = mpsc::channel();
    let tx = Arc::new(Mutex::new(tx));

    let on_message = Arc::clone(&tx);
    channel.on_message(Arc::new(move |event: &MessageEvent| {
        let sender = on_message.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = sender.send(Outcome::Message(event.data.clone()));
    }));
    channel.on_close(Arc::new(move |event: &CloseEvent| {
        let sender = tx.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = sender.send(Outcome::Closed {
            code: event.code,
            reason: event.reason.clone(),
        });
    }));
    rx
}

fn wait_for_reply(
    outcomes: &mpsc::Receiver<Outcome>,
    timeout: Duration,
) -> CliResult<MessageData> {
    match outcomes.recv_timeout(timeout) {
        Ok(Outcome::Message(data)) => Ok(data),
        Ok(Outcome::Closed { code, reason }) => Err(CliError::new(
            FAILURE,
            format!("channel closed before reply (code {code}): {reason}"),
        )),
        Err(RecvTimeoutError::Timeout) => {
            Err(CliError::new(TIMEOUT, format!("no reply within {timeout:?}")))
        }
        Err(RecvTimeoutError::Disconnected) => {
            Err(CliError::new(FAILURE, "channel listeners dropped"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_before_reply_is_failure() {
        let (tx, rx) = mpsc::channel();
        tx.send(Outcome::Closed {
            code: 1008,
            reason: "no handler for routing code".to_string(),
        })
        .unwrap();

        let err = wait_for_reply(&rx, Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.code, FAILURE);
        assert!(err.message.contains("1008"));
    }

    #[test]
    fn silence_is_timeout() {
        let (_tx, rx) = mpsc::channel::<Outcome>();
        let err = wait_for_reply(&rx, Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.code, TIMEOUT);
    }

    #[test]
    fn text_flag_wins_payload_kind() {
        let args = OpenArgs {
            path: "/tmp/unused.sock".into(),
            code: "ECHO".to_string(),
            data: None,
            text: Some("hi".to_string()),
            file: None,
            wait: false,
            wait_timeout: "5s".to_string(),
        };
        assert!(matches!(resolve_payload(&args), Ok(Payload::Text(t)) if t == "hi"));
    }
}
