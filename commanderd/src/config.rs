//! Commander configuration.
//!
//! The commander is a long-running service, so everything comes from the
//! environment; the two CLI flags (`--secret`, `--debug`) only override.

use std::collections::HashSet;

use anyhow::{bail, Result};
use tracing::warn;

use fleet_protocol::CHANNEL_COMMANDS;

#[derive(Debug, Clone)]
pub struct CommanderConfig {
    pub irc_server: String,
    pub irc_port: u16,
    pub irc_nick: String,
    pub irc_channels: Vec<String>,
    pub irc_use_tls: bool,

    /// Shared HMAC secret; the process refuses to start without one.
    pub secret: String,
    /// Empty set means any signed sender is accepted.
    pub allowed_users: HashSet<String>,
    /// Senders permitted to issue privileged commands; empty means any
    /// signed sender.
    pub privileged_users: HashSet<String>,

    pub redis_url: String,

    pub rate_limit_requests: usize,
    pub rate_limit_window_secs: i64,
}

impl Default for CommanderConfig {
    fn default() -> Self {
        Self {
            irc_server: "irc.libera.chat".to_string(),
            irc_port: 6667,
            irc_nick: "fleet_commander".to_string(),
            irc_channels: vec![CHANNEL_COMMANDS.to_string()],
            irc_use_tls: false,
            secret: String::new(),
            allowed_users: HashSet::new(),
            privileged_users: HashSet::new(),
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            rate_limit_requests: 20,
            rate_limit_window_secs: 60,
        }
    }
}

impl CommanderConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(server) = std::env::var("IRC_SERVER") {
            cfg.irc_server = server;
        }
        if let Some(port) = env_parse::<u16>("IRC_PORT") {
            cfg.irc_port = port;
        }
        if let Ok(nick) = std::env::var("IRC_NICK") {
            cfg.irc_nick = nick;
        }
        if let Ok(channels) = std::env::var("IRC_CHANNELS") {
            let parsed = split_list(&channels);
            if !parsed.is_empty() {
                cfg.irc_channels = parsed;
            }
        }
        cfg.irc_use_tls = std::env::var("IRC_USE_TLS")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        if let Ok(secret) = std::env::var("FLEET_HMAC_SECRET") {
            cfg.secret = secret;
        }
        if let Ok(users) = std::env::var("IRC_ALLOWED_USERS") {
            cfg.allowed_users = split_list(&users).into_iter().collect();
        }
        if let Ok(users) = std::env::var("IRC_PRIVILEGED_USERS") {
            cfg.privileged_users = split_list(&users).into_iter().collect();
        }

        if let Ok(url) = std::env::var("REDIS_URL") {
            cfg.redis_url = url;
        }
        if let Some(n) = env_parse::<usize>("IRC_RATE_LIMIT") {
            cfg.rate_limit_requests = n;
        }
        if let Some(n) = env_parse::<i64>("IRC_RATE_WINDOW") {
            cfg.rate_limit_window_secs = n;
        }

        cfg
    }

    pub fn validate(&self) -> Result<()> {
        if self.secret.trim().is_empty() {
            bail!("FLEET_HMAC_SECRET is required (refusing to start unsigned)");
        }
        if self.irc_channels.is_empty() {
            bail!("at least one IRC channel is required");
        }
        Ok(())
    }

    pub fn primary_channel(&self) -> &str {
        &self.irc_channels[0]
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("Invalid {} value '{}': {}", name, raw, err);
                None
            }
        },
        Err(_) => None,
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
