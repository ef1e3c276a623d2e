use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chanmux_peer::{HandshakeConfig, Server};
use tracing::info;

use crate::cmd::{install_ctrlc_handler, parse_duration, ServeArgs};
use crate::demo;
use crate::exit::{peer_error, CliError, CliResult, SUCCESS, USAGE};

pub fn run(args: ServeArgs) -> CliResult<i32> {
    if args.max_channels == 0 {
        return Err(CliError::new(USAGE, "--max-channels must be at least 1"));
    }
    let handshake = HandshakeConfig {
        timeout: parse_duration(&args.handshake_timeout)?,
        ..HandshakeConfig::default()
    };

    let server = Server::bind(&args.path, demo::registry())
        .map_err(|err| peer_error("bind failed", err))?
        .with_handshake_config(handshake)
        .with_max_channels(args.max_channels);

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    info!(path = %args.path.display(), "chanmux server listening");
    let served = server.serve(&running);
    server.shutdown();
    served.map_err(|err| peer_error("serve failed", err))?;

    info!("chanmux server stopped");
    Ok(SUCCESS)
}
