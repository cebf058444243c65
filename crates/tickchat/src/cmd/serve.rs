use std::time::Duration;

use tickchat_server::{ChatServer, ServerConfig, ServerHandle};

use crate::cmd::{parse_duration, ServeArgs};
use crate::exit::{server_error, CliError, CliResult, INTERNAL, SUCCESS, USAGE};
use crate::output::OutputFormat;

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let config = build_config(&args)?;
    let mut server = ChatServer::bind(config).map_err(|err| server_error("bind failed", err))?;

    install_ctrlc_handler(server.handle())?;
    if let Some(addr) = server.local_addr() {
        announce(&addr.to_string(), format);
    }

    server
        .run()
        .map_err(|err| server_error("server stopped", err))?;
    Ok(SUCCESS)
}

fn build_config(args: &ServeArgs) -> CliResult<ServerConfig> {
    if args.lobby_max == 0 || args.channel_max == 0 {
        return Err(CliError::new(USAGE, "capacities must be greater than zero"));
    }
    if args.poll_ms == 0 {
        return Err(CliError::new(USAGE, "--poll-ms must be greater than zero"));
    }

    let mut config = ServerConfig {
        host: args.host.clone(),
        port: args.port,
        lobby_capacity: args.lobby_max,
        channel_capacity: args.channel_max,
        poll_timeout: Duration::from_millis(args.poll_ms),
        lobby_timeout: parse_duration(&args.lobby_timeout)?,
        channel_idle_timeout: parse_duration(&args.channel_idle)?,
        ..ServerConfig::default()
    };
    for setting in &args.settings {
        config
            .apply_setting(setting)
            .map_err(|err| server_error("invalid setting", err))?;
    }
    Ok(config)
}

fn announce(addr: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({ "event": "listening", "addr": addr })
        ),
        OutputFormat::Raw => println!("{addr}"),
        OutputFormat::Table | OutputFormat::Pretty => println!("tickchat listening on {addr}"),
    }
}

fn install_ctrlc_handler(handle: ServerHandle) -> CliResult<()> {
    ctrlc::set_handler(move || {
        tracing::info!("interrupt received, stopping");
        handle.stop();
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
