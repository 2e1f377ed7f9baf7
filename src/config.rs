use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use log::warn;

pub const ROOM_TTL: Duration = Duration::from_secs(15 * 60); // 15 minutes
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(15);
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(45);
pub const ROOM_RETENTION: Duration = Duration::from_secs(60 * 60);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const SYNC_INTERVAL: Duration = Duration::from_millis(50);
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub const DEFAULT_PORT: u16 = 2052;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub static_dir: PathBuf,
    pub room_ttl: Duration,
    pub sweep_interval: Duration,
    pub client_timeout: Duration,
    /// How long closed and expired rooms stay readable before the sweeper
    /// deletes them.
    pub room_retention: Duration,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub store_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            static_dir: PathBuf::from("public"),
            room_ttl: ROOM_TTL,
            sweep_interval: SWEEP_INTERVAL,
            client_timeout: CLIENT_TIMEOUT,
            room_retention: ROOM_RETENTION,
            tls_cert: None,
            tls_key: None,
            store_path: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `MIDNIGHT_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = ServerConfig::default();

        if let Some(bind) = parse_var(&lookup, "MIDNIGHT_BIND") {
            config.bind = bind;
        }
        if let Some(dir) = lookup("MIDNIGHT_STATIC_DIR") {
            config.static_dir = PathBuf::from(dir);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "MIDNIGHT_ROOM_TTL_SECS") {
            config.room_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "MIDNIGHT_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "MIDNIGHT_CLIENT_TIMEOUT_SECS") {
            config.client_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "MIDNIGHT_ROOM_RETENTION_SECS") {
            config.room_retention = Duration::from_secs(secs);
        }
        config.tls_cert = lookup("MIDNIGHT_TLS_CERT").map(PathBuf::from);
        config.tls_key = lookup("MIDNIGHT_TLS_KEY").map(PathBuf::from);
        config.store_path = lookup("MIDNIGHT_STORE_PATH").map(PathBuf::from);

        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparseable {}={:?}, keeping default", key, raw);
            None
        }
    }
}

/// Client-side timing for the netplay adapters.
#[derive(Debug, Clone)]
pub struct NetplayConfig {
    /// `http://host:port` (or `https://`); the WebSocket URL is derived from it.
    pub base_url: String,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub sync_interval: Duration,
    pub poll_interval: Duration,
    pub max_consecutive_failures: u32,
    pub outbox_capacity: usize,
}

impl NetplayConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        NetplayConfig {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            connect_timeout: CONNECT_TIMEOUT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            sync_interval: SYNC_INTERVAL,
            poll_interval: POLL_INTERVAL,
            max_consecutive_failures: 100,
            outbox_capacity: 256,
        }
    }

    pub fn websocket_url(&self) -> String {
        let rest = self
            .base_url
            .strip_prefix("https://")
            .map(|rest| format!("wss://{rest}"))
            .or_else(|| {
                self.base_url
                    .strip_prefix("http://")
                    .map(|rest| format!("ws://{rest}"))
            })
            .unwrap_or_else(|| self.base_url.clone());
        format!("{rest}/ws")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_apply_and_bad_values_keep_defaults() {
        let vars: HashMap<&str, &str> = [
            ("MIDNIGHT_BIND", "127.0.0.1:9000"),
            ("MIDNIGHT_ROOM_TTL_SECS", "60"),
            ("MIDNIGHT_CLIENT_TIMEOUT_SECS", "not-a-number"),
            ("MIDNIGHT_STORE_PATH", "rooms.json"),
            ("MIDNIGHT_ROOM_RETENTION_SECS", "600"),
        ]
        .into_iter()
        .collect();

        let config = ServerConfig::from_lookup(|key| vars.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.bind, SocketAddr::from(([127, 0, 0, 1], 9000)));
        assert_eq!(config.room_ttl, Duration::from_secs(60));
        assert_eq!(config.client_timeout, CLIENT_TIMEOUT);
        assert_eq!(config.store_path, Some(PathBuf::from("rooms.json")));
        assert_eq!(config.room_retention, Duration::from_secs(600));
        assert!(config.tls_cert.is_none());
    }

    #[test]
    fn websocket_url_follows_scheme() {
        assert_eq!(
            NetplayConfig::new("http://localhost:2052/").websocket_url(),
            "ws://localhost:2052/ws"
        );
        assert_eq!(
            NetplayConfig::new("https://play.example.com").websocket_url(),
            "wss://play.example.com/ws"
        );
    }
}
