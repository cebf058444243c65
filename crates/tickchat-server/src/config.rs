use std::net::SocketAddr;
use std::time::Duration;

use tickchat_frame::FrameConfig;

use crate::error::{Result, ServerError};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 4800;
/// Default connection limit of the lobby and of each channel.
pub const DEFAULT_CAPACITY: usize = 32;

/// Everything needed to start a [`crate::ChatServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Connections allowed in the lobby at once.
    pub lobby_capacity: usize,
    /// Members allowed per channel.
    pub channel_capacity: usize,
    /// Upper bound on one readiness wait.
    pub poll_timeout: Duration,
    /// Time a connection may stay in the lobby without joining.
    pub lobby_timeout: Duration,
    /// Time a channel must stay empty before it is reclaimed.
    pub channel_idle_timeout: Duration,
    /// Minimum spacing between lobby and channel sweeps.
    pub sweep_interval: Duration,
    pub frame: FrameConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            lobby_capacity: DEFAULT_CAPACITY,
            channel_capacity: DEFAULT_CAPACITY,
            poll_timeout: Duration::from_millis(100),
            lobby_timeout: Duration::from_secs(5),
            channel_idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(1),
            frame: FrameConfig::default(),
        }
    }
}

impl ServerConfig {
    /// `host:port` suitable for binding; IPv6 hosts are bracketed.
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Apply one `key=value` setting in the legacy command-line form.
    ///
    /// Keys: `host` (optionally with `:port`), `port`, `lobbyN`, `chN`.
    pub fn apply_setting(&mut self, setting: &str) -> Result<()> {
        let invalid = || ServerError::InvalidSetting(setting.to_string());
        let (key, value) = setting.split_once('=').ok_or_else(invalid)?;
        let value = value.trim();

        match key.trim() {
            "host" => {
                if let Ok(addr) = value.parse::<SocketAddr>() {
                    self.host = addr.ip().to_string();
                    self.port = addr.port();
                } else if let Some((host, port)) = value
                    .rsplit_once(':')
                    .filter(|(host, _)| !host.contains(':'))
                {
                    self.host = host.to_string();
                    self.port = port.parse().map_err(|_| invalid())?;
                } else if !value.is_empty() {
                    self.host = value.to_string();
                } else {
                    return Err(invalid());
                }
            }
            "port" => self.port = value.parse().map_err(|_| invalid())?,
            "lobbyN" => self.lobby_capacity = parse_capacity(value).ok_or_else(invalid)?,
            "chN" => self.channel_capacity = parse_capacity(value).ok_or_else(invalid)?,
            _ => return Err(invalid()),
        }
        Ok(())
    }

    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            capacity: self.channel_capacity,
            poll_timeout: self.poll_timeout,
            idle_timeout: self.channel_idle_timeout,
            frame: self.frame.clone(),
        }
    }
}

fn parse_capacity(value: &str) -> Option<usize> {
    value.parse::<usize>().ok().filter(|n| *n > 0)
}

/// Per-channel settings handed to the channel manager.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub capacity: usize,
    pub poll_timeout: Duration,
    pub idle_timeout: Duration,
    pub frame: FrameConfig,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        ServerConfig::default().channel_settings()
    }
}
