use std::net::Shutdown;
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use chanmux_frame::{FrameError, MessageWriter, StreamConfig};
use chanmux_transport::IpcStream;
use tracing::debug;

/// Outbound half of a physical connection.
///
/// `send_message` writes one whole message; concurrent callers are queued,
/// never interleaved.
pub trait PhysicalSocket: Send + Sync {
    fn send_message(&self, message: &[u8]) -> chanmux_frame::Result<()>;

    /// Close the connection in both directions. Wakes the reader with EOF.
    fn shutdown(&self);
}

/// Inbound half: whatever consumes the messages read off a physical connection.
pub trait FrameSink: Send + Sync {
    /// One complete message (normally an encoded frame), in read order.
    fn on_physical_message(&self, message: Bytes);

    /// The connection ended. Called once, after the last message.
    fn on_physical_close(&self);
}

/// [`PhysicalSocket`] over a local stream, writing envelopes under a mutex.
pub struct StreamSocket {
    writer: Mutex<MessageWriter<IpcStream>>,
    control: IpcStream,
}

impl StreamSocket {
    /// Wrap the write side of `stream`. The caller keeps its own handle for reading.
    pub fn new(stream: IpcStream, config: StreamConfig) -> chanmux_frame::Result<Self> {
        let control = stream.try_clone().map_err(FrameError::from)?;
        let writer = MessageWriter::with_config_ipc(stream, config)?;
        Ok(Self {
            writer: Mutex::new(writer),
            control,
        })
    }
}

impl PhysicalSocket for StreamSocket {
    fn send_message(&self, message: &[u8]) -> chanmux_frame::Result<()> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(message)
    }

    fn shutdown(&self) {
        // A separate handle, so a writer blocked on a full socket cannot hold this up.
        if let Err(err) = self.control.shutdown(Shutdown::Both) {
            debug!(error = %err, "physical socket shutdown failed");
        }
    }
}


#[cfg(test)]
mod tests {
    use std::io::Read;

    use chanmux_frame::{encode_frame, FrameKind, MessageReader};

    use super::*;

    #[test]
    fn stream_socket_writes_envelopes() {
        let (left, right) = IpcStream::pair().unwrap();
        let socket = StreamSocket::new(left, StreamConfig::default()).unwrap();
        let mut reader = MessageReader::new(right);

        socket
            .send_message(&encode_frame(FrameKind::Data, 9, b"abc"))
            .unwrap();

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.channel_id, 9);
        assert_eq!(frame.payload.as_ref(), b"abc");
    }

    #[test]
    fn shutdown_gives_peer_eof() {
        let (left, mut right) = IpcStream::pair().unwrap();
        let socket = StreamSocket::new(left, StreamConfig::default()).unwrap();

        socket.shutdown();
        let mut buf = [0u8; 4];
        assert_eq!(right.read(&mut buf).unwrap(), 0);
        assert!(socket.send_message(b"late").is_err());
    }
}
