use std::io::{ErrorKind, Read};

use bytes::{Bytes, BytesMut};
use chanmux_transport::IpcStream;

use crate::codec::{decode_frame, Frame};
use crate::envelope::{decode_envelope, StreamConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads whole enveloped messages from any `Read` stream.
///
/// Partial reads are handled internally; callers always get complete messages.
pub struct MessageReader<T> {
    inner: T,
    buf: BytesMut,
    config: StreamConfig,
}

impl<T: Read> MessageReader<T> {
    /// Create a new reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, StreamConfig::default())
    }

    /// Create a new reader with explicit configuration.
    pub fn with_config(inner: T, config: StreamConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Read the next complete message (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` at EOF.
    pub fn read_message(&mut self) -> Result<Bytes> {
        loop {
            if let Some(message) = decode_envelope(&mut self.buf, self.config.max_message_size)? {
                return Ok(message);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Read the next message and decode it as a frame.
    pub fn read_frame(&mut self) -> Result<Frame> {
        decode_frame(self.read_message()?)
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum message size for subsequent reads.
    pub fn set_max_message_size(&mut self, max_message_size: usize) {
        self.config.max_message_size = max_message_size;
    }

    /// Current reader configuration.
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }
}

impl MessageReader<IpcStream> {
    /// Create a reader for `IpcStream` and apply the read timeout from config.
    pub fn with_config_ipc(inner: IpcStream, config: StreamConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(FrameError::from)?;
        Ok(Self::with_config(inner, config))
    }

    /// Change the read timeout on the underlying stream.
    pub fn set_read_timeout(&mut self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.inner
            .set_read_timeout(timeout)
            .map_err(FrameError::from)?;
        self.config.read_timeout = timeout;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::BufMut;

    use super::*;
    use crate::codec::encode_frame;
    use crate::envelope::{encode_envelope, MAGIC};
    use crate::kind::FrameKind;

    fn wire_of(frames: &[(FrameKind, u32, &[u8])]) -> Vec<u8> {
        let mut wire = BytesMut::new();
        for (kind, id, payload) in frames {
            encode_envelope(&encode_frame(*kind, *id, payload), &mut wire).unwrap();
        }
        wire.to_vec()
    }

    #[test]
    fn reads_frames_in_order() {
        let wire = wire_of(&[
            (FrameKind::Open, 1, &b"\x04\x00ECHO"[..]),
            (FrameKind::Data, 1, &b"one"[..]),
            (FrameKind::Close, 1, &b""[..]),
        ]);
        let mut reader = MessageReader::new(Cursor::new(wire));

        let f1 = reader.read_frame().unwrap();
        let f2 = reader.read_frame().unwrap();
        let f3 = reader.read_frame().unwrap();

        assert_eq!(f1.kind, FrameKind::Open);
        assert_eq!((f2.kind, f2.payload.as_ref()), (FrameKind::Data, &b"one"[..]));
        assert_eq!(f3.kind, FrameKind::Close);
        assert!(matches!(
            reader.read_frame(),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn malformed_frame_inside_valid_envelope_is_returned_raw() {
        let mut wire = BytesMut::new();
        encode_envelope(&[1, 2, 3], &mut wire).unwrap();
        let mut reader = MessageReader::new(Cursor::new(wire.to_vec()));

        let message = reader.read_message().unwrap();
        assert_eq!(message.as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn partial_reads_are_reassembled() {
        let wire = wire_of(&[(FrameKind::Text, 4, &b"slow"[..])]);
        let mut reader = MessageReader::new(ByteByByteReader { bytes: wire, pos: 0 });

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.channel_id, 4);
        assert_eq!(frame.payload.as_ref(), b"slow");
    }

    #[test]
    fn eof_mid_envelope_is_connection_closed() {
        let mut partial = BytesMut::new();
        partial.put_slice(&MAGIC);
        partial.put_u32_le(16);
        partial.put_slice(b"only-part");

        let mut reader = MessageReader::new(Cursor::new(partial.to_vec()));
        assert!(matches!(
            reader.read_message(),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn oversized_message_rejected() {
        let mut wire = BytesMut::new();
        wire.put_slice(&MAGIC);
        wire.put_u32_le(1024);

        let cfg = StreamConfig {
            max_message_size: 16,
            ..StreamConfig::default()
        };
        let mut reader = MessageReader::with_config(Cursor::new(wire.to_vec()), cfg);
        assert!(matches!(
            reader.read_message(),
            Err(FrameError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn interrupted_read_retries() {
        let wire = wire_of(&[(FrameKind::Data, 8, &b"ok"[..])]);
        let mut reader = MessageReader::new(InterruptedOnce {
            interrupted: false,
            inner: Cursor::new(wire),
        });

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.channel_id, 8);
    }

    #[test]
    fn roundtrip_over_socket_pair() {
        let (left, right) = IpcStream::pair().unwrap();
        let mut writer = crate::writer::MessageWriter::new(left);
        let mut reader = MessageReader::new(right);

        writer.write_frame(FrameKind::Data, 42, b"ping").unwrap();
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.channel_id, 42);
        assert_eq!(frame.payload.as_ref(), b"ping");
    }

    #[test]
    fn applies_read_timeout_for_ipc_stream() {
        let (left, _right) = IpcStream::pair().unwrap();
        let cfg = StreamConfig {
            read_timeout: Some(std::time::Duration::from_millis(10)),
            ..StreamConfig::default()
        };

        let mut reader = MessageReader::with_config_ipc(left, cfg).unwrap();
        let err = reader.read_message().unwrap_err();
        assert!(matches!(
            err,
            FrameError::Io(e)
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut
        ));
    }

    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct InterruptedOnce {
        interrupted: bool,
        inner: Cursor<Vec<u8>>,
    }

    impl Read for InterruptedOnce {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            self.inner.read(buf)
        }
    }
}
