use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    println!("chanmux {}", env!("CARGO_PKG_VERSION"));
    if !args.extended {
        return Ok(SUCCESS);
    }

    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    println!(
        "protocol: {} {}",
        chanmux_peer::HandshakeConfig::default().protocol_name,
        chanmux_peer::HandshakeConfig::default().protocol_version
    );
    println!("max_message: {}", chanmux_frame::DEFAULT_MAX_MESSAGE);

    Ok(SUCCESS)
}
