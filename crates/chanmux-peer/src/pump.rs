use std::io::Read;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chanmux_channel::FrameSink;
use chanmux_frame::{FrameError, MessageReader};
use chanmux_transport::{IpcStream, TransportError};
use tracing::{debug, error, warn};

use crate::error::Result;

/// Read messages off a physical socket until it ends.
///
/// Messages reach `sink` strictly in read order. When the stream ends, for
/// whatever reason, `on_physical_close` is called exactly once. A panic out
/// of the sink ends the stream too.
pub fn pump<R: Read>(reader: &mut MessageReader<R>, sink: &dyn FrameSink) {
    loop {
        match reader.read_message() {
            Ok(message) => {
                let routed = catch_unwind(AssertUnwindSafe(|| sink.on_physical_message(message)));
                if routed.is_err() {
                    error!("frame sink panicked, dropping physical connection");
                    break;
                }
            }
            Err(FrameError::ConnectionClosed) => {
                debug!("physical connection reached end of stream");
                break;
            }
            Err(err) => {
                warn!(error = %err, "physical connection read failed");
                break;
            }
        }
    }
    sink.on_physical_close();
}

/// Run [`pump`] on a dedicated thread named `name`.
pub fn spawn_pump(
    mut reader: MessageReader<IpcStream>,
    sink: Arc<dyn FrameSink>,
    name: String,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || pump(&mut reader, sink.as_ref()))
        .map_err(TransportError::Io)?;
    Ok(handle)
}
