use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use chanmux_frame::{
    FrameError, FrameKind, MessageReader, MessageWriter, CONTROL_CHANNEL, HEADER_SIZE,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PeerError, Result};

/// Action that turns a connection into a multiplexer instead of a direct channel.
pub const MULTIPLEX_ACTION: &str = "multiplex";

const MAX_PROTOCOL_LEN: usize = 32;
const MAX_VERSION_LEN: usize = 16;
const MAX_ACTION_LEN: usize = 64;
const MAX_PARAMS: usize = 32;
const MAX_PARAM_KEY_LEN: usize = 64;
const MAX_PARAM_VALUE_LEN: usize = 1024;

/// Client request, sent as a `Data` frame on the control id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Protocol name. Must be `chanmux` by default.
    pub protocol: String,
    /// Protocol version string (`<major>.<minor>`).
    pub version: String,
    /// Routing action for this connection.
    pub action: String,
    /// Free-form request parameters handed to the dispatcher.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

/// Server answer to an accepted [`ConnectRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectResponse {
    /// Protocol name. Must match request protocol.
    pub protocol: String,
    /// Server protocol version.
    pub version: String,
    /// Server-assigned connection identifier.
    pub connection_id: u64,
}

/// Result of a successful handshake, on either side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    pub connection_id: u64,
    /// Version the server announced.
    pub protocol_version: String,
    pub action: String,
    pub params: BTreeMap<String, String>,
}

impl HandshakeResult {
    /// Whether the client asked for a multiplexed connection.
    pub fn is_multiplexed(&self) -> bool {
        self.action == MULTIPLEX_ACTION
    }
}

/// Configuration for the connect handshake.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Deadline for the whole exchange.
    pub timeout: Duration,
    /// Expected protocol name.
    pub protocol_name: String,
    /// Local protocol version.
    pub protocol_version: String,
    /// Maximum handshake payload size in bytes.
    pub max_handshake_payload: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            protocol_name: "chanmux".to_string(),
            protocol_version: "1.0".to_string(),
            max_handshake_payload: 16 * 1024,
        }
    }
}

impl HandshakeConfig {
    /// Stream limits for the pre-handshake phase: a tight message budget and
    /// the handshake deadline as the socket timeouts.
    pub fn stream_config(&self) -> chanmux_frame::StreamConfig {
        chanmux_frame::StreamConfig {
            max_message_size: self.max_handshake_payload + HEADER_SIZE,
            read_timeout: Some(self.timeout),
            write_timeout: Some(self.timeout),
        }
    }
}

/// Perform the client side of the handshake.
pub fn handshake_client<R: Read, W: Write>(
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
    action: &str,
    params: &BTreeMap<String, String>,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;
    validate_action(action)?;
    validate_params(params)?;

    let req = ConnectRequest {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        action: action.to_string(),
        params: params.clone(),
    };
    send_control_json(writer, &req)?;

    let deadline = Instant::now() + config.timeout;
    let payload = recv_control_payload(reader, deadline, config)?;
    let resp: ConnectResponse = serde_json::from_slice(&payload)?;

    validate_protocol_name(&resp.protocol)?;
    validate_version(&resp.version)?;

    if resp.protocol != config.protocol_name {
        return Err(PeerError::HandshakeFailed(format!(
            "unknown protocol '{}' (expected '{}')",
            resp.protocol, config.protocol_name
        )));
    }

    if !is_version_compatible(&config.protocol_version, &resp.version)? {
        return Err(PeerError::HandshakeFailed(format!(
            "incompatible version '{}' (local '{}')",
            resp.version, config.protocol_version
        )));
    }

    debug!(
        connection_id = resp.connection_id,
        action, "client handshake complete"
    );
    Ok(HandshakeResult {
        connection_id: resp.connection_id,
        protocol_version: resp.version,
        action: req.action,
        params: req.params,
    })
}

/// Perform the server side of the handshake.
///
/// A rejected request is answered with an `Error` frame carrying the reason
/// before the error is returned.
pub fn handshake_server<R: Read, W: Write>(
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
    connection_id: u64,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;

    let deadline = Instant::now() + config.timeout;
    let outcome = recv_control_payload(reader, deadline, config).and_then(|payload| {
        let req: ConnectRequest = serde_json::from_slice(&payload)?;
        validate_request(&req, config)?;
        Ok(req)
    });

    let req = match outcome {
        Ok(req) => req,
        Err(err) => {
            if !matches!(err, PeerError::Disconnected(_) | PeerError::Timeout(_)) {
                reject(writer, &err);
            }
            return Err(err);
        }
    };

    let resp = ConnectResponse {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        connection_id,
    };
    send_control_json(writer, &resp)?;

    debug!(connection_id, action = %req.action, "server handshake complete");
    Ok(HandshakeResult {
        connection_id,
        protocol_version: config.protocol_version.clone(),
        action: req.action,
        params: req.params,
    })
}

fn validate_request(req: &ConnectRequest, config: &HandshakeConfig) -> Result<()> {
    validate_protocol_name(&req.protocol)?;
    validate_version(&req.version)?;
    validate_action(&req.action)?;
    validate_params(&req.params)?;

    if req.protocol != config.protocol_name {
        return Err(PeerError::HandshakeFailed(format!(
            "unknown protocol '{}' (expected '{}')",
            req.protocol, config.protocol_name
        )));
    }

    if !is_version_compatible(&req.version, &config.protocol_version)? {
        return Err(PeerError::HandshakeFailed(format!(
            "incompatible version '{}' (server '{}')",
            req.version, config.protocol_version
        )));
    }
    Ok(())
}

fn reject<W: Write>(writer: &mut MessageWriter<W>, err: &PeerError) {
    let reason = err.to_string();
    if let Err(send_err) = writer.write_frame(FrameKind::Error, CONTROL_CHANNEL, reason.as_bytes())
    {
        debug!(error = %send_err, "handshake rejection not delivered");
    }
}

fn send_control_json<T: Serialize, W: Write>(
    writer: &mut MessageWriter<W>,
    value: &T,
) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    writer.write_frame(FrameKind::Data, CONTROL_CHANNEL, &payload)?;
    Ok(())
}

fn recv_control_payload<R: Read>(
    reader: &mut MessageReader<R>,
    deadline: Instant,
    config: &HandshakeConfig,
) -> Result<Vec<u8>> {
    loop {
        if Instant::now() >= deadline {
            return Err(PeerError::Timeout(config.timeout));
        }

        match reader.read_frame() {
            Ok(frame) => {
                if frame.channel_id != CONTROL_CHANNEL {
                    return Err(PeerError::HandshakeFailed(format!(
                        "expected control channel {}, got {}",
                        CONTROL_CHANNEL, frame.channel_id
                    )));
                }
                match frame.kind {
                    FrameKind::Data => {}
                    FrameKind::Error => {
                        return Err(PeerError::HandshakeFailed(format!(
                            "rejected by peer: {}",
                            String::from_utf8_lossy(&frame.payload)
                        )));
                    }
                    other => {
                        return Err(PeerError::HandshakeFailed(format!(
                            "unexpected {other} frame during handshake"
                        )));
                    }
                }
                if frame.payload.len() > config.max_handshake_payload {
                    return Err(PeerError::HandshakeFailed(format!(
                        "handshake payload too large: {} (max {})",
                        frame.payload.len(),
                        config.max_handshake_payload
                    )));
                }
                return Ok(frame.payload.to_vec());
            }
            Err(FrameError::Io(err))
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(FrameError::ConnectionClosed) => {
                return Err(PeerError::Disconnected(
                    "connection closed during handshake".to_string(),
                ));
            }
            Err(FrameError::PayloadTooLarge { size, max }) => {
                return Err(PeerError::HandshakeFailed(format!(
                    "handshake payload too large: {size} (max {max})"
                )));
            }
            Err(err) => return Err(PeerError::Frame(err)),
        }
    }
}

fn validate_protocol_name(protocol: &str) -> Result<()> {
    if protocol.is_empty() || protocol.len() > MAX_PROTOCOL_LEN {
        return Err(PeerError::HandshakeFailed(format!(
            "invalid protocol name length: {}",
            protocol.len()
        )));
    }
    Ok(())
}

fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(PeerError::HandshakeFailed(format!(
            "invalid protocol version length: {}",
            version.len()
        )));
    }
    let _ = parse_version(version)?;
    Ok(())
}

fn validate_action(action: &str) -> Result<()> {
    if action.is_empty() || action.len() > MAX_ACTION_LEN {
        return Err(PeerError::HandshakeFailed(format!(
            "invalid action length: {}",
            action.len()
        )));
    }
    if let Some(bad) = action
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')))
    {
        return Err(PeerError::HandshakeFailed(format!(
            "invalid character {bad:?} in action '{action}'"
        )));
    }
    Ok(())
}

fn validate_params(params: &BTreeMap<String, String>) -> Result<()> {
    if params.len() > MAX_PARAMS {
        return Err(PeerError::HandshakeFailed(format!(
            "too many params: {} (max {})",
            params.len(),
            MAX_PARAMS
        )));
    }
    for (key, value) in params {
        if key.is_empty() || key.len() > MAX_PARAM_KEY_LEN {
            return Err(PeerError::HandshakeFailed(format!(
                "invalid param key length: {}",
                key.len()
            )));
        }
        if value.len() > MAX_PARAM_VALUE_LEN {
            return Err(PeerError::HandshakeFailed(format!(
                "param '{key}' too long: {} (max {})",
                value.len(),
                MAX_PARAM_VALUE_LEN
            )));
        }
    }
    Ok(())
}

fn is_version_compatible(client_version: &str, server_version: &str) -> Result<bool> {
    let (client_major, client_minor) = parse_version(client_version)?;
    let (server_major, server_minor) = parse_version(server_version)?;

    Ok(client_major == server_major && client_minor >= server_minor)
}

fn parse_version(version: &str) -> Result<(u16, u16)> {
    let invalid =
        |why: &str| PeerError::HandshakeFailed(format!("invalid version '{version}': {why}"));

    let mut parts = version.split('.');
    let major = parts.next().ok_or_else(|| invalid("missing major"))?;
    let minor = parts.next().ok_or_else(|| invalid("missing minor"))?;
    if parts.next().is_some() {
        return Err(invalid("expected '<major>.<minor>'"));
    }

    let major = major
        .parse::<u16>()
        .map_err(|_| invalid("non-numeric major"))?;
    let minor = minor
        .parse::<u16>()
        .map_err(|_| invalid("non-numeric minor"))?;

    Ok((major, minor))
}
