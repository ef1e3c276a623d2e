use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::exit::{CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod open;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the demo handlers (ECHO, UPPR, action "echo").
    Serve(ServeArgs),
    /// Open one multiplexed channel, send a message, optionally print the reply.
    Open(OpenArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args),
        Command::Open(args) => open::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Maximum channels per multiplexed connection.
    #[arg(long, env = "CHANMUX_MAX_CHANNELS", default_value = "1024")]
    pub max_channels: usize,
    /// Handshake deadline for new connections (e.g. 5s, 500ms).
    #[arg(long, env = "CHANMUX_HANDSHAKE_TIMEOUT", default_value = "5s")]
    pub handshake_timeout: String,
}

#[derive(Args, Debug)]
pub struct OpenArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Routing code for the channel (e.g. ECHO, UPPR).
    #[arg(long)]
    pub code: String,
    /// Binary payload given as a string.
    #[arg(long, conflicts_with_all = ["text", "file"])]
    pub data: Option<String>,
    /// Text payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub text: Option<String>,
    /// Read a binary payload from file.
    #[arg(long, conflicts_with_all = ["data", "text"])]
    pub file: Option<PathBuf>,
    /// Wait for one reply and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for the reply when --wait is set (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

pub(crate) fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert_eq!(parse_duration(" ").unwrap_err().code, USAGE);
    }
}
