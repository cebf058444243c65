mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "tickchat", version, about = "Channel-based TCP chat server")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        env = "TICKCHAT_LOG_LEVEL",
        default_value = "info",
        global = true
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve_with_legacy_settings() {
        let cli = Cli::try_parse_from([
            "tickchat",
            "serve",
            "--port",
            "5000",
            "--channel-max",
            "8",
            "lobbyN=64",
            "host=127.0.0.1",
        ])
        .expect("serve args should parse");

        match cli.command {
            Command::Serve(args) => {
                assert_eq!(args.port, 5000);
                assert_eq!(args.channel_max, 8);
                assert_eq!(args.settings, ["lobbyN=64", "host=127.0.0.1"]);
            }
            other => panic!("expected serve, got {other:?}"),
        }
    }

    #[test]
    fn send_requires_a_name() {
        let err = Cli::try_parse_from(["tickchat", "send", "127.0.0.1:4800", "--channel", "2"])
            .expect_err("missing --name should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn parses_send_subcommand() {
        let cli = Cli::try_parse_from([
            "tickchat",
            "--format",
            "json",
            "send",
            "127.0.0.1:4800",
            "--channel",
            "2",
            "--name",
            "ivy",
            "--text",
            "hello",
        ])
        .expect("send args should parse");

        assert!(matches!(cli.format, Some(OutputFormat::Json)));
        assert!(matches!(cli.command, Command::Send(_)));
    }

    #[test]
    fn parses_doctor_subcommand() {
        let cli = Cli::try_parse_from(["tickchat", "doctor", "--port", "0"])
            .expect("doctor args should parse");
        assert!(matches!(cli.command, Command::Doctor(_)));
    }
}
