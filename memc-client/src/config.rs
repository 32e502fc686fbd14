//! # Client Configuration
//!
//! Purpose: Describe the cluster and connection tuning in one plain struct
//! that can be built in code or deserialized from JSON.
//!
//! ```json
//! {
//!   "servers": ["cache-a:11211", "cache-b"],
//!   "default_ttl": 300,
//!   "reconnect": { "floor_ms": 10, "ceiling_ms": 128000 },
//!   "nodelay": true
//! }
//! ```

use serde::Deserialize;
use thiserror::Error;

use memc_common::protocol::{DEFAULT_HOST, DEFAULT_PORT};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no servers configured")]
    NoServers,
    #[error("invalid port in server address {0:?}")]
    InvalidPort(String),
}

/// Reconnect backoff bounds in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub floor_ms: u64,
    pub ceiling_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            floor_ms: 10,
            ceiling_ms: 128_000,
        }
    }
}

/// Configuration for the client and its per-server connections.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `host[:port]` entries, one connection each.
    pub servers: Vec<String>,
    /// Default time-to-live in seconds for stores without an explicit
    /// `exptime`; 0 keeps items until evicted.
    pub default_ttl: u32,
    pub reconnect: ReconnectConfig,
    /// Disable Nagle's algorithm on every socket.
    pub nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            servers: vec![format!("{}:{}", DEFAULT_HOST, DEFAULT_PORT)],
            default_ttl: 0,
            reconnect: ReconnectConfig::default(),
            nodelay: true,
        }
    }
}

impl ClientConfig {
    /// Default configuration for the given servers.
    pub fn with_servers<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ClientConfig {
            servers: servers.into_iter().map(Into::into).collect(),
            ..ClientConfig::default()
        }
    }

    /// Parses a JSON configuration document; missing fields take defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Normalized `host:port` address for every configured server.
    pub fn addresses(&self) -> Result<Vec<String>, ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }
        self.servers.iter().map(|entry| server_address(entry)).collect()
    }
}

/// Normalizes one `host[:port]` entry, filling in `localhost` and `11211`.
pub fn server_address(entry: &str) -> Result<String, ConfigError> {
    let entry = entry.trim();
    let (host, port) = match entry.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') || host.ends_with(']') => (host, Some(port)),
        _ => (entry, None),
    };

    let host = if host.is_empty() { DEFAULT_HOST } else { host };
    let port = match port {
        None | Some("") => DEFAULT_PORT,
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort(entry.to_string()))?,
    };

    if host.contains(':') && !host.starts_with('[') {
        Ok(format!("[{}]:{}", host, port))
    } else {
        Ok(format!("{}:{}", host, port))
    }
}
