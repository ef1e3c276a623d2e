use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use chanmux_channel::MessageData;
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// One message received on a virtual channel.
pub struct Reply<'a> {
    pub channel_id: u32,
    pub code: &'a str,
    pub data: &'a MessageData,
}

#[derive(Serialize)]
struct ReplyOutput<'a> {
    channel_id: u32,
    code: &'a str,
    kind: &'static str,
    payload_size: usize,
    payload: String,
    timestamp: String,
}

impl<'a> Reply<'a> {
    fn kind(&self) -> &'static str {
        if self.data.is_text() {
            "text"
        } else {
            "binary"
        }
    }

    fn to_output(&self) -> ReplyOutput<'a> {
        ReplyOutput {
            channel_id: self.channel_id,
            code: self.code,
            kind: self.kind(),
            payload_size: self.data.len(),
            payload: payload_preview(self.data.as_bytes()),
            timestamp: now_unix_seconds(),
        }
    }
}

pub fn print_reply(reply: &Reply<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(&reply.to_output()).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let out = reply.to_output();
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CHANNEL", "CODE", "KIND", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    out.channel_id.to_string(),
                    out.code.to_string(),
                    out.kind.to_string(),
                    out.payload_size.to_string(),
                    out.payload,
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "channel={} code={} kind={} size={} payload={}",
                reply.channel_id,
                reply.code,
                reply.kind(),
                reply.data.len(),
                payload_preview(reply.data.as_bytes())
            );
        }
        OutputFormat::Raw => print_raw(reply.data.as_bytes()),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn json_output_describes_text_reply() {
        let data = MessageData::Text("PING".to_string());
        let reply = Reply {
            channel_id: 1,
            code: "UPPR",
            data: &data,
        };
        let value = serde_json::to_value(reply.to_output()).expect("reply should serialize");

        assert_eq!(value["channel_id"], 1);
        assert_eq!(value["code"], "UPPR");
        assert_eq!(value["kind"], "text");
        assert_eq!(value["payload"], "PING");
    }

    #[test]
    fn binary_preview_hides_non_utf8() {
        let data = MessageData::Binary(Bytes::from_static(&[0xff, 0x00, 0x10]));
        let reply = Reply {
            channel_id: 3,
            code: "ECHO",
            data: &data,
        };
        let out = reply.to_output();
        assert_eq!(out.kind, "binary");
        assert_eq!(out.payload, "<binary 3 bytes>");
    }
}
