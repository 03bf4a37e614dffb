//! Configuration system for Cairn.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CAIRN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cairn/config.toml
//!   3. ~/.config/cairn/config.toml

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CairnConfig {
    pub daemon: DaemonConfig,
    pub aggregator: AggregatorConfig,
    pub http: HttpConfig,
}

/// Settings for the gossip daemon (`cairnd`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Interfaces to bind UDP multicast listeners on.
    pub interfaces: Vec<String>,
    /// UDP port of the gossip fabric.
    pub udp_port: u16,
    /// TCP stream listener address. Empty = disabled.
    pub listen_tcp: String,
    /// Unix stream listener path. Empty = disabled.
    pub listen_unix: String,
    /// Initial operation mode: 0 slave, 1 master, 2 stealth master.
    pub mode: u8,
    /// Drop transactions with sequence gaps instead of committing what
    /// arrived. Leave on unless your data policy mandates differently.
    pub drop_incomplete: bool,

    #[serde(with = "humantime_serde")]
    pub announcement_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub master_max_age: Duration,
    #[serde(with = "humantime_serde")]
    pub master_purge_interval: Duration,
    /// Wait for outstanding packets for this long after the final packet
    /// (which may itself arrive out of order).
    #[serde(with = "humantime_serde")]
    pub wait_complete: Duration,
    #[serde(with = "humantime_serde")]
    pub transaction_max_age: Duration,
    #[serde(with = "humantime_serde")]
    pub transaction_purge_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub wait_master_reply: Duration,
    #[serde(with = "humantime_serde")]
    pub sync_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub store_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub store_purge_interval: Duration,
}

/// Settings for the mesh aggregator (`cairn-backend`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Socket type for reaching the local daemon: "unix" or "tcp".
    pub network: String,
    /// Socket address (unix path or host:port).
    pub address: String,
    /// Wait between successful update runs; also the socket deadline.
    #[serde(with = "humantime_serde")]
    pub update_wait: Duration,
    /// Wait after a failed update run before retrying.
    #[serde(with = "humantime_serde")]
    pub retry_wait: Duration,
    /// Consider a node offline after not hearing of it for this long.
    #[serde(with = "humantime_serde")]
    pub offline_after: Duration,
    #[serde(with = "humantime_serde")]
    pub node_purge: Duration,
    #[serde(with = "humantime_serde")]
    pub node_purge_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub vis_purge: Duration,
    #[serde(with = "humantime_serde")]
    pub vis_purge_interval: Duration,
    /// Write nodes.json / graph.json into this directory. Empty = disabled.
    pub json_dir: String,
    /// Read a nodes.json-compatible file at startup. Empty = disabled.
    pub import_nodes: String,
    /// Keep imported nodes forever (no invalidation).
    pub import_persistent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// HTTP listen address for the JSON endpoints. Empty = disabled.
    pub listen: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            udp_port: crate::wire::UDP_PORT,
            listen_tcp: String::new(),
            listen_unix: "/var/run/cairn.sock".into(),
            mode: 0,
            drop_incomplete: true,
            announcement_interval: Duration::from_secs(10),
            master_max_age: Duration::from_secs(120),
            master_purge_interval: Duration::from_secs(30),
            wait_complete: Duration::from_secs(5),
            transaction_max_age: Duration::from_secs(20),
            transaction_purge_interval: Duration::from_secs(3),
            wait_master_reply: Duration::from_secs(10),
            sync_interval: Duration::from_secs(10),
            store_ttl: Duration::from_secs(600),
            store_purge_interval: Duration::from_secs(20),
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            network: "unix".into(),
            address: "/var/run/cairn.sock".into(),
            update_wait: Duration::from_secs(60),
            retry_wait: Duration::from_secs(10),
            offline_after: Duration::from_secs(300),
            node_purge: Duration::from_secs(21 * 24 * 3600),
            node_purge_interval: Duration::from_secs(3600),
            vis_purge: Duration::from_secs(300),
            vis_purge_interval: Duration::from_secs(60),
            json_dir: String::new(),
            import_nodes: String::new(),
            import_persistent: false,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "[::]:8080".into(),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CairnConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CairnConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CAIRN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CairnConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply CAIRN_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CAIRN_DAEMON__INTERFACES") {
            self.daemon.interfaces = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(v) = std::env::var("CAIRN_DAEMON__MODE") {
            if let Ok(m) = v.parse() {
                self.daemon.mode = m;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_DAEMON__LISTEN_TCP") {
            self.daemon.listen_tcp = v;
        }
        if let Ok(v) = std::env::var("CAIRN_DAEMON__LISTEN_UNIX") {
            self.daemon.listen_unix = v;
        }
        if let Ok(v) = std::env::var("CAIRN_AGGREGATOR__NETWORK") {
            self.aggregator.network = v;
        }
        if let Ok(v) = std::env::var("CAIRN_AGGREGATOR__ADDRESS") {
            self.aggregator.address = v;
        }
        if let Ok(v) = std::env::var("CAIRN_HTTP__LISTEN") {
            self.http.listen = v;
        }
    }
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("cairn")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
