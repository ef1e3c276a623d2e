use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use chanmux_channel::{
    ChannelState, DirectChannel, Multiplexer, MuxConfig, MwRegistry, RequestContext,
    RequestParameters, Role, StreamSocket, VirtualChannel,
};
use chanmux_frame::{MessageReader, MessageWriter, StreamConfig, GOING_AWAY, POLICY_VIOLATION};
use chanmux_transport::{PeerCredentials, TransportError, UnixDomainSocket};
use tracing::{debug, info, warn};

use crate::error::{PeerError, Result};
use crate::handshake::{handshake_server, HandshakeConfig, HandshakeResult};
use crate::pump::spawn_pump;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Server-side connection settings.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub handshake: HandshakeConfig,
    /// Limits for the connection once the handshake is done.
    pub stream: StreamConfig,
    /// Multiplexer settings. The role is always forced to [`Role::Server`].
    pub mux: MuxConfig,
}

/// What [`Server::accept`] did with a connection.
pub enum Accepted {
    /// The client asked to multiplex; peer-opened channels are dispatched
    /// through the registry as they arrive.
    Multiplexed(Arc<Multiplexer>),
    /// A handler claimed the direct connection.
    Direct(Arc<DirectChannel>),
    /// Nothing claimed the action; the connection was closed with 1008.
    Rejected(RequestParameters),
}

enum Live {
    Multiplexed(Weak<Multiplexer>),
    Direct(Weak<DirectChannel>),
}

impl Live {
    fn is_alive(&self) -> bool {
        match self {
            Self::Multiplexed(mux) => mux.upgrade().is_some_and(|mux| !mux.is_closed()),
            Self::Direct(channel) => channel
                .upgrade()
                .is_some_and(|channel| channel.state() != ChannelState::Closed),
        }
    }
}

/// Listens on a Unix domain socket and attaches every accepted connection to
/// the handlers in a [`MwRegistry`].
pub struct Server {
    socket: UnixDomainSocket,
    registry: Arc<MwRegistry>,
    config: ServerConfig,
    next_connection_id: AtomicU64,
    live: Mutex<Vec<Live>>,
}

impl Server {
    /// Bind to a Unix domain socket path.
    pub fn bind(path: impl AsRef<Path>, registry: Arc<MwRegistry>) -> Result<Self> {
        let socket = UnixDomainSocket::bind(path)?;
        Ok(Self {
            socket,
            registry,
            config: ServerConfig::default(),
            next_connection_id: AtomicU64::new(1),
            live: Mutex::new(Vec::new()),
        })
    }

    /// Override the whole server config.
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override handshake config.
    pub fn with_handshake_config(mut self, config: HandshakeConfig) -> Self {
        self.config.handshake = config;
        self
    }

    /// Override the post-handshake stream limits.
    pub fn with_stream_config(mut self, config: StreamConfig) -> Self {
        self.config.stream = config;
        self
    }

    /// Cap the number of channels per multiplexed connection.
    pub fn with_max_channels(mut self, max_channels: usize) -> Self {
        self.config.mux.max_channels = max_channels;
        self
    }

    /// Bound socket path.
    pub fn path(&self) -> &Path {
        self.socket.path()
    }

    pub fn registry(&self) -> &Arc<MwRegistry> {
        &self.registry
    }

    /// Connections accepted and not yet closed.
    pub fn live_connections(&self) -> usize {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        live.retain(Live::is_alive);
        live.len()
    }

    /// Accept the next connection, run the handshake and attach it.
    ///
    /// Blocks until a client connects, unless called from [`Self::serve`].
    pub fn accept(&self) -> Result<Accepted> {
        let stream = self.socket.accept()?;
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let peer_credentials = stream.peer_credentials();

        let handshake_stream = self.config.handshake.stream_config();
        let mut reader =
            MessageReader::with_config_ipc(stream.try_clone()?, handshake_stream.clone())?;
        let mut writer = MessageWriter::with_config_ipc(stream.try_clone()?, handshake_stream)?;
        let handshake =
            handshake_server(&mut reader, &mut writer, connection_id, &self.config.handshake)?;
        drop(writer);

        // The handshake ran under a tighter budget; switch to runtime limits.
        reader.set_max_message_size(self.config.stream.max_message_size);
        reader.set_read_timeout(self.config.stream.read_timeout)?;
        let socket = Arc::new(StreamSocket::new(stream, self.config.stream.clone())?);

        if handshake.is_multiplexed() {
            let mux = Multiplexer::new(
                socket,
                Arc::clone(&self.registry),
                self.config.mux.clone().with_role(Role::Server),
            );
            spawn_pump(
                reader,
                mux.clone(),
                format!("chanmux-conn-{connection_id}"),
            )?;
            info!(connection_id, "multiplexed connection accepted");
            self.track(Live::Multiplexed(Arc::downgrade(&mux)));
            return Ok(Accepted::Multiplexed(mux));
        }

        let channel = DirectChannel::new(socket);
        let ctx = RequestContext {
            channel: Arc::clone(&channel),
            request: request_parameters(handshake, peer_credentials),
        };

        if self.registry.dispatch_request(&ctx).is_none() {
            if channel.state() == ChannelState::Open {
                warn!(connection_id, action = %ctx.request.action, "no handler for action");
                channel.close(Some(POLICY_VIOLATION), Some("no handler for action"));
            }
            return Ok(Accepted::Rejected(ctx.request));
        }

        spawn_pump(
            reader,
            channel.clone(),
            format!("chanmux-conn-{connection_id}"),
        )?;
        info!(connection_id, action = %ctx.request.action, "direct connection accepted");
        self.track(Live::Direct(Arc::downgrade(&channel)));
        Ok(Accepted::Direct(channel))
    }

    /// Accept connections on the calling thread until `running` turns false.
    ///
    /// Per-connection failures are logged and do not stop the loop.
    pub fn serve(&self, running: &AtomicBool) -> Result<()> {
        self.socket.set_nonblocking(true)?;
        info!(path = ?self.path(), "serving");

        while running.load(Ordering::SeqCst) {
            match self.accept() {
                Ok(Accepted::Rejected(request)) => {
                    debug!(connection_id = request.connection_id, "connection rejected");
                }
                Ok(_) => {}
                Err(PeerError::Transport(TransportError::Accept(err)))
                    if err.kind() == ErrorKind::WouldBlock =>
                {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(err) => {
                    warn!(error = %err, "connection setup failed");
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }

        self.socket.set_nonblocking(false)?;
        Ok(())
    }

    /// Close every live connection with 1001 (going away).
    pub fn shutdown(&self) {
        let live = std::mem::take(&mut *self.live.lock().unwrap_or_else(PoisonError::into_inner));
        info!(connections = live.len(), "closing live connections");
        for conn in live {
            match conn {
                Live::Multiplexed(mux) => {
                    if let Some(mux) = mux.upgrade() {
                        mux.close(GOING_AWAY, Some("server shutting down"));
                    }
                }
                Live::Direct(channel) => {
                    if let Some(channel) = channel.upgrade() {
                        channel.close(Some(GOING_AWAY), Some("server shutting down"));
                    }
                }
            }
        }
    }

    fn track(&self, conn: Live) {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        live.retain(Live::is_alive);
        live.push(conn);
    }
}

fn request_parameters(
    handshake: HandshakeResult,
    peer_credentials: Option<PeerCredentials>,
) -> RequestParameters {
    RequestParameters {
        connection_id: handshake.connection_id,
        action: handshake.action,
        params: handshake.params,
        peer_credentials,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::mpsc;

    use chanmux_channel::{CloseEvent, Handler, MessageEvent, Mw, MwFactory};

    use super::*;
    use crate::connector::connect;
    use crate::handshake::MULTIPLEX_ACTION;

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
        dir.join("server.sock")
    }

    fn cleanup(sock_path: &Path) {
        if let Some(parent) = sock_path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    struct Echo;

    impl Handler for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn on_message(&self, channel: &dyn VirtualChannel, event: &MessageEvent) {
            let _ = channel.send(event.data.as_bytes());
        }
    }

    struct EchoAction;

    impl MwFactory for EchoAction {
        fn name(&self) -> &str {
            "echo-action"
        }

        fn process_request(
            &self,
            ctx: &RequestContext,
        ) -> std::result::Result<Option<Arc<Mw>>, chanmux_channel::MwError> {
            if ctx.request.action != "echo" {
                return Ok(None);
            }
            Ok(Some(Mw::bind(ctx.channel.clone(), Arc::new(Echo))))
        }
    }

    fn registry() -> Arc<MwRegistry> {
        let registry = Arc::new(MwRegistry::new());
        registry.register(Arc::new(EchoAction));
        registry
    }

    fn recv_one(channel: &dyn VirtualChannel) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        channel.on_message(Arc::new(move |event: &MessageEvent| {
            let _ = tx.lock().unwrap().send(event.data.as_bytes().to_vec());
        }));
        rx
    }

    #[test]
    fn direct_connection_is_dispatched() {
        let sock_path = make_sock_path("direct");
        let server = Server::bind(&sock_path, registry()).expect("server should bind");

        let accept = thread::spawn(move || {
            let accepted = server.accept().expect("server should accept");
            assert!(matches!(accepted, Accepted::Direct(_)));
            server
        });

        let client = connect(&sock_path, "echo", &BTreeMap::new())
            .expect("client should connect")
            .into_direct()
            .expect("direct channel should start");
        let server = accept.join().expect("server thread should finish");
        assert_eq!(server.live_connections(), 1);

        let rx = recv_one(client.as_ref());
        client.send(b"hello").expect("send should succeed");
        let echoed = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("echo should arrive");
        assert_eq!(echoed, b"hello");

        client.close(None, None);
        cleanup(&sock_path);
    }

    #[test]
    fn unclaimed_action_is_closed_with_policy_violation() {
        let sock_path = make_sock_path("reject");
        let server = Server::bind(&sock_path, registry()).expect("server should bind");

        let accept = thread::spawn(move || match server.accept() {
            Ok(Accepted::Rejected(request)) => request,
            Ok(_) => panic!("connection should be rejected"),
            Err(err) => panic!("accept failed: {err}"),
        });

        let client = connect(&sock_path, "nope", &BTreeMap::new())
            .expect("client should connect")
            .into_direct()
            .expect("direct channel should start");
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        client.on_close(Arc::new(move |event: &CloseEvent| {
            let _ = tx.lock().unwrap().send(event.code);
        }));

        let request = accept.join().expect("server thread should finish");
        assert_eq!(request.action, "nope");
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5))
                .expect("close should arrive"),
            POLICY_VIOLATION
        );
        assert_eq!(client.state(), ChannelState::Closed);
        cleanup(&sock_path);
    }

    #[test]
    fn multiplexed_connection_assigns_sequential_ids() {
        let sock_path = make_sock_path("mux");
        let server = Server::bind(&sock_path, registry()).expect("server should bind");

        let accept = thread::spawn(move || {
            let first = server.accept().expect("first accept should succeed");
            let second = server.accept().expect("second accept should succeed");
            (first, second)
        });

        let c1 = connect(&sock_path, MULTIPLEX_ACTION, &BTreeMap::new())
            .expect("first client should connect");
        let c2 = connect(&sock_path, MULTIPLEX_ACTION, &BTreeMap::new())
            .expect("second client should connect");
        let (first, second) = accept.join().expect("server thread should finish");

        assert_eq!(c1.connection_id(), 1);
        assert_eq!(c2.connection_id(), 2);
        match (first, second) {
            (Accepted::Multiplexed(a), Accepted::Multiplexed(b)) => {
                assert_eq!(a.config().role, Role::Server);
                assert_eq!(b.config().role, Role::Server);
            }
            _ => panic!("both connections should be multiplexed"),
        }
        cleanup(&sock_path);
    }

    #[test]
    fn serve_stops_when_flag_clears() {
        let sock_path = make_sock_path("serve");
        let server = Arc::new(Server::bind(&sock_path, registry()).expect("server should bind"));
        let running = Arc::new(AtomicBool::new(true));

        let serve = {
            let server = Arc::clone(&server);
            let running = Arc::clone(&running);
            thread::spawn(move || server.serve(&running))
        };

        let client = connect(&sock_path, "echo", &BTreeMap::new())
            .expect("client should connect")
            .into_direct()
            .expect("direct channel should start");
        let rx = recv_one(client.as_ref());
        client.send(b"via serve").expect("send should succeed");
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5))
                .expect("echo should arrive"),
            b"via serve"
        );

        running.store(false, Ordering::SeqCst);
        serve
            .join()
            .expect("serve thread should finish")
            .expect("serve should return cleanly");

        let (tx, closed) = mpsc::channel();
        let tx = Mutex::new(tx);
        client.on_close(Arc::new(move |event: &CloseEvent| {
            let _ = tx.lock().unwrap().send(event.code);
        }));
        server.shutdown();
        assert_eq!(
            closed
                .recv_timeout(Duration::from_secs(5))
                .expect("close should arrive"),
            GOING_AWAY
        );
        cleanup(&sock_path);
    }
}
