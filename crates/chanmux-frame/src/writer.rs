use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use chanmux_transport::IpcStream;
use tracing::trace;

use crate::codec::{encode_frame, Frame};
use crate::envelope::{encode_envelope, StreamConfig};
use crate::error::{FrameError, Result};
use crate::kind::FrameKind;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes whole enveloped messages to any `Write` stream.
///
/// One call writes one envelope in full; callers sharing a stream across
/// threads must serialize access (see the channel crate's socket wrapper).
pub struct MessageWriter<T> {
    inner: T,
    buf: BytesMut,
    config: StreamConfig,
}

impl<T: Write> MessageWriter<T> {
    /// Create a new writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, StreamConfig::default())
    }

    /// Create a new writer with explicit configuration.
    pub fn with_config(inner: T, config: StreamConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Send one message (blocking). The message is normally an encoded frame.
    pub fn send(&mut self, message: &[u8]) -> Result<()> {
        if message.len() > self.config.max_message_size {
            return Err(FrameError::PayloadTooLarge {
                size: message.len(),
                max: self.config.max_message_size,
            });
        }

        self.buf.clear();
        encode_envelope(message, &mut self.buf)?;

        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                // With a write timeout set, WouldBlock is the timeout firing.
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock && self.config.write_timeout.is_none() =>
                {
                    trace!(written = offset, total = self.buf.len(), "write would block, retrying");
                    continue;
                }
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()
    }

    /// Encode and send one frame.
    pub fn write_frame(&mut self, kind: FrameKind, channel_id: u32, payload: &[u8]) -> Result<()> {
        self.send(&encode_frame(kind, channel_id, payload))
    }

    /// Send an already-built frame.
    pub fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        self.send(&frame.encode())
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current writer configuration.
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }
}

impl MessageWriter<IpcStream> {
    /// Create a writer for `IpcStream` and apply the write timeout from config.
    pub fn with_config_ipc(inner: IpcStream, config: StreamConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(FrameError::from)?;
        Ok(Self::with_config(inner, config))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::decode_frame;
    use crate::envelope::decode_envelope;

    fn decode_all(wire: Vec<u8>) -> Vec<Frame> {
        let mut buf = BytesMut::from(wire.as_slice());
        let mut frames = Vec::new();
        while let Some(message) = decode_envelope(&mut buf, usize::MAX).unwrap() {
            frames.push(decode_frame(message).unwrap());
        }
        assert!(buf.is_empty());
        frames
    }

    #[test]
    fn writes_one_envelope_per_frame() {
        let mut writer = MessageWriter::new(Cursor::new(Vec::<u8>::new()));

        writer.write_frame(FrameKind::Data, 1, b"hello").unwrap();
        writer
            .send_frame(&Frame::new(FrameKind::Text, 2, "world"))
            .unwrap();

        let frames = decode_all(writer.into_inner().into_inner());
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind, FrameKind::Data);
        assert_eq!(frames[0].payload.as_ref(), b"hello");
        assert_eq!(frames[1].kind, FrameKind::Text);
        assert_eq!(frames[1].channel_id, 2);
    }

    #[test]
    fn rejects_oversized_message() {
        let cfg = StreamConfig {
            max_message_size: 8,
            ..StreamConfig::default()
        };
        let mut writer = MessageWriter::with_config(Cursor::new(Vec::<u8>::new()), cfg);

        let err = writer
            .write_frame(FrameKind::Data, 1, b"too long for eight")
            .unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { max: 8, .. }));
        assert!(writer.get_ref().get_ref().is_empty());
    }

    #[test]
    fn retries_interrupted_and_short_writes() {
        let mut writer = MessageWriter::new(ChoppyWriter {
            out: Vec::new(),
            calls: 0,
        });

        writer.write_frame(FrameKind::Close, 3, &[0xe8, 0x03]).unwrap();

        let frames = decode_all(writer.into_inner().out);
        assert_eq!(frames[0].kind, FrameKind::Close);
        assert_eq!(frames[0].payload.as_ref(), &[0xe8, 0x03]);
    }

    #[test]
    fn zero_length_write_is_connection_closed() {
        let mut writer = MessageWriter::new(ZeroWriter);
        assert!(matches!(
            writer.send(b"x"),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn applies_write_timeout_for_ipc_stream() {
        let (left, _right) = IpcStream::pair().unwrap();
        let cfg = StreamConfig {
            write_timeout: Some(std::time::Duration::from_millis(25)),
            ..StreamConfig::default()
        };

        let writer = MessageWriter::with_config_ipc(left, cfg).unwrap();
        assert_eq!(
            writer.config().write_timeout,
            Some(std::time::Duration::from_millis(25))
        );
    }

    #[test]
    fn write_timeout_fails_on_full_socket() {
        let (left, _right) = IpcStream::pair().unwrap();
        let cfg = StreamConfig {
            write_timeout: Some(std::time::Duration::from_millis(25)),
            ..StreamConfig::default()
        };
        let mut writer = MessageWriter::with_config_ipc(left, cfg).unwrap();

        // Nobody reads `_right`, so the socket buffer fills up.
        let big = vec![0u8; 4 * 1024 * 1024];
        assert!(matches!(writer.send(&big), Err(FrameError::Io(_))));
    }

    /// Alternates between `Interrupted` and writing at most two bytes.
    struct ChoppyWriter {
        out: Vec<u8>,
        calls: usize,
    }

    impl Write for ChoppyWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.calls += 1;
            if self.calls % 2 == 1 {
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            let n = buf.len().min(2);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct ZeroWriter;

    impl Write for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
