use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod doctor;
pub mod send;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server.
    Serve(ServeArgs),
    /// Join a channel, optionally say something, and print what comes back.
    Send(SendArgs),
    /// Run local environment health checks.
    Doctor(DoctorArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Doctor(args) => doctor::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,
    /// Port to listen on (0 picks a free port).
    #[arg(long, env = "PORT", default_value_t = tickchat_server::DEFAULT_PORT)]
    pub port: u16,
    /// Connections allowed to wait in the lobby.
    #[arg(long, default_value_t = tickchat_server::DEFAULT_CAPACITY)]
    pub lobby_max: usize,
    /// Members allowed per channel.
    #[arg(long, default_value_t = tickchat_server::DEFAULT_CAPACITY)]
    pub channel_max: usize,
    /// Upper bound on one readiness wait, in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub poll_ms: u64,
    /// How long a connection may stay in the lobby without joining (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub lobby_timeout: String,
    /// How long a channel may stay empty before it is reclaimed.
    #[arg(long, default_value = "300s")]
    pub channel_idle: String,
    /// Legacy settings: host=<addr[:port]>, port=<n>, lobbyN=<n>, chN=<n>.
    #[arg(value_name = "KEY=VALUE")]
    pub settings: Vec<String>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Server address (host:port).
    #[arg(default_value = "127.0.0.1:4800")]
    pub addr: String,
    /// Channel to join.
    #[arg(long, short = 'c', default_value_t = 1)]
    pub channel: u32,
    /// Display name to join under.
    #[arg(long, short = 'n')]
    pub name: String,
    /// Text to send once joined.
    #[arg(long, short = 't')]
    pub text: Option<String>,
    /// Timestamp (epoch ms) to attach; the local clock is used if omitted.
    #[arg(long)]
    pub timestamp: Option<u64>,
    /// Maximum time to wait for the server (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
}

#[derive(Args, Debug)]
pub struct DoctorArgs {
    /// Host whose port availability is checked.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,
    /// Port whose availability is checked.
    #[arg(long, env = "PORT", default_value_t = tickchat_server::DEFAULT_PORT)]
    pub port: u16,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `5s`, `150ms` or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
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
        assert!(parse_duration(" ").is_err());
    }
}
