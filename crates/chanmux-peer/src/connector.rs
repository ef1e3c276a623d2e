use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chanmux_channel::{DirectChannel, Multiplexer, MuxConfig, MwRegistry, Role, StreamSocket};
use chanmux_frame::{MessageReader, MessageWriter, StreamConfig};
use chanmux_transport::IpcStream;
#[cfg(unix)]
use chanmux_transport::UnixDomainSocket;

use crate::error::Result;
use crate::handshake::{handshake_client, HandshakeConfig, HandshakeResult, MULTIPLEX_ACTION};
use crate::pump::spawn_pump;

/// Client-side connection settings.
#[derive(Debug, Clone, Default)]
pub struct ConnectConfig {
    pub handshake: HandshakeConfig,
    /// Limits for the connection once the handshake is done.
    pub stream: StreamConfig,
    /// Multiplexer settings. The role is always forced to [`Role::Client`].
    pub mux: MuxConfig,
}

/// A connected, handshaken client socket that has not been attached yet.
///
/// Nothing reads from the socket until it becomes a direct channel or a
/// multiplexer; frames the server sends in the meantime stay buffered.
pub struct Connection {
    reader: MessageReader<IpcStream>,
    socket: Arc<StreamSocket>,
    handshake: HandshakeResult,
    mux: MuxConfig,
}

impl Connection {
    pub fn connection_id(&self) -> u64 {
        self.handshake.connection_id
    }

    pub fn handshake(&self) -> &HandshakeResult {
        &self.handshake
    }

    /// Use the physical socket as a single channel and start reading.
    pub fn into_direct(self) -> Result<Arc<DirectChannel>> {
        let channel = DirectChannel::new(self.socket);
        spawn_pump(
            self.reader,
            channel.clone(),
            format!("chanmux-client-{}", self.handshake.connection_id),
        )?;
        Ok(channel)
    }

    /// Carry many channels over the socket and start reading. Channels the
    /// server opens are dispatched through `registry`.
    pub fn into_multiplexer(self, registry: Arc<MwRegistry>) -> Result<Arc<Multiplexer>> {
        let mux = Multiplexer::new(self.socket, registry, self.mux.with_role(Role::Client));
        spawn_pump(
            self.reader,
            mux.clone(),
            format!("chanmux-client-{}", self.handshake.connection_id),
        )?;
        Ok(mux)
    }
}

/// Connect to a listening server as a client.
pub fn connect(
    path: impl AsRef<Path>,
    action: &str,
    params: &BTreeMap<String, String>,
) -> Result<Connection> {
    connect_with_config(path, action, params, &ConnectConfig::default())
}

/// Connect with the `multiplex` action and attach a multiplexer.
pub fn connect_multiplexed(
    path: impl AsRef<Path>,
    registry: Arc<MwRegistry>,
) -> Result<Arc<Multiplexer>> {
    connect(path, MULTIPLEX_ACTION, &BTreeMap::new())?.into_multiplexer(registry)
}

/// Connect with explicit configuration.
pub fn connect_with_config(
    path: impl AsRef<Path>,
    action: &str,
    params: &BTreeMap<String, String>,
    config: &ConnectConfig,
) -> Result<Connection> {
    #[cfg(not(unix))]
    {
        let _ = (action, params, config);
        let path = path.as_ref().to_path_buf();
        return Err(chanmux_transport::TransportError::Connect {
            path,
            source: std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "chanmux-peer requires Unix domain sockets",
            ),
        }
        .into());
    }

    #[cfg(unix)]
    {
        let stream = UnixDomainSocket::connect(path)?;
        let handshake_stream = config.handshake.stream_config();

        let mut reader =
            MessageReader::with_config_ipc(stream.try_clone()?, handshake_stream.clone())?;
        let mut writer = MessageWriter::with_config_ipc(stream.try_clone()?, handshake_stream)?;
        let handshake =
            handshake_client(&mut reader, &mut writer, action, params, &config.handshake)?;
        drop(writer);

        // The handshake ran under a tighter budget; switch to runtime limits.
        reader.set_max_message_size(config.stream.max_message_size);
        reader.set_read_timeout(config.stream.read_timeout)?;
        let socket = Arc::new(StreamSocket::new(stream, config.stream.clone())?);

        Ok(Connection {
            reader,
            socket,
            handshake,
            mux: config.mux.clone(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;
    use std::sync::mpsc;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    use chanmux_channel::{
        ChannelContext, ChannelError, Handler, MessageEvent, Mw, MwError, MwFactory,
        VirtualChannel,
    };

    use super::*;
    use crate::error::PeerError;
    use crate::listener::{Accepted, Server};

    fn make_sock_path(tag: &str) -> PathBuf {
        let dir = std::path::PathBuf::from(format!(
            "/tmp/chanmux-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir.join("connector.sock")
    }

    struct Upper;

    impl Handler for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn on_message(&self, channel: &dyn VirtualChannel, event: &MessageEvent) {
            if let Some(text) = event.data.as_text() {
                let _ = channel.send_text(&text.to_uppercase());
            }
        }
    }

    struct UpperCode;

    impl MwFactory for UpperCode {
        fn name(&self) -> &str {
            "upper-code"
        }

        fn process_channel(
            &self,
            ctx: &ChannelContext,
        ) -> std::result::Result<Option<Arc<Mw>>, MwError> {
            if ctx.code != "UPPR" {
                return Ok(None);
            }
            Ok(Some(Mw::bind(ctx.channel.clone(), Arc::new(Upper))))
        }
    }

    #[test]
    fn multiplexed_roundtrip_over_uds() {
        let sock_path = make_sock_path("roundtrip");
        let registry = Arc::new(MwRegistry::new());
        registry.register(Arc::new(UpperCode));
        let server = Server::bind(&sock_path, registry).expect("server should bind");

        let accept = thread::spawn(move || {
            let accepted = server.accept().expect("server should accept");
            (server, accepted)
        });

        let mux = connect_multiplexed(&sock_path, Arc::new(MwRegistry::new()))
            .expect("client should connect");
        let (_server, accepted) = accept.join().expect("server thread should finish");
        assert!(matches!(accepted, Accepted::Multiplexed(_)));

        let channel = mux.open_channel("UPPR", None).expect("open should succeed");
        assert_eq!(channel.id() % 2, 1);

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        channel.on_message(Arc::new(move |event: &MessageEvent| {
            let text = event.data.as_text().map(str::to_string);
            let _ = tx.lock().unwrap().send(text);
        }));
        channel.send_text("shout").expect("send should succeed");

        let reply = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("reply should arrive");
        assert_eq!(reply.as_deref(), Some("SHOUT"));

        mux.close(1000, None);
        assert!(matches!(
            channel.send_text("late"),
            Err(ChannelError::ChannelClosed { .. })
        ));

        if let Some(parent) = sock_path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn connect_to_missing_socket_fails() {
        let sock_path = make_sock_path("missing");
        let result = connect(&sock_path, "echo", &BTreeMap::new());
        assert!(matches!(result, Err(PeerError::Transport(_))));

        if let Some(parent) = sock_path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn invalid_action_fails_before_connecting_handlers() {
        let sock_path = make_sock_path("badaction");
        let server =
            Server::bind(&sock_path, Arc::new(MwRegistry::new())).expect("server should bind");

        let accept = thread::spawn(move || server.accept().map(|_| ()));

        let result = connect(&sock_path, "bad action", &BTreeMap::new());
        assert!(matches!(result, Err(PeerError::HandshakeFailed(_))));

        // The client never sent a request; the server sees the hangup.
        assert!(matches!(
            accept.join().expect("server thread should finish"),
            Err(PeerError::Disconnected(_))
        ));

        if let Some(parent) = sock_path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }
}
