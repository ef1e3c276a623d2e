//! Wire codec for chanmux.
//!
//! Every message on a physical socket is one frame:
//! - 1 byte frame kind (open, data, close, error, text)
//! - 4 byte little-endian channel id (0 is the physical/control channel)
//! - the payload, owned by whichever handler is bound to the channel
//!
//! On a byte stream each frame travels inside an envelope (magic + length) so
//! the reader always sees whole frames. The frame and close-info codecs are
//! pure functions; payloads are sliced, never copied.

pub mod close;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod kind;
pub mod open;
pub mod reader;
pub mod writer;

pub use close::{
    decode_close_info, encode_close_info, CloseInfo, ABNORMAL_CLOSURE, GOING_AWAY,
    INTERNAL_ERROR, NORMAL_CLOSURE, NO_STATUS_RECEIVED, POLICY_VIOLATION, PROTOCOL_ERROR,
};
pub use codec::{decode_frame, encode_frame, Frame, CONTROL_CHANNEL, HEADER_SIZE};
pub use envelope::{
    decode_envelope, encode_envelope, StreamConfig, DEFAULT_MAX_MESSAGE, ENVELOPE_HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use kind::FrameKind;
pub use open::{decode_open_request, encode_open_request, OpenRequest, MAX_CODE_LEN};
pub use reader::MessageReader;
pub use writer::MessageWriter;
