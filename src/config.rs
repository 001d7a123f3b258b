//! Configuration loading and types for the bulletin board server.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: networking, the record store, the worker pool, cluster
//! replication, and logging.  Command-line flags may override individual
//! fields after loading.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// TCP listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Record store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Worker pool and admission queue settings.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Cluster / replication settings.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Debug mode: verbose logging plus deliberately slowed store I/O so
    /// the locking discipline is observable from several terminals.
    #[serde(default)]
    pub debug: bool,
}

/// TCP listener configuration.
///
/// The server listens on two ports.  Both accept peer and client
/// sessions identically; the split exists so operators can firewall the
/// synchronization port separately.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bulletin protocol port.
    #[serde(default = "default_bbport")]
    pub bbport: u16,

    /// Peer synchronization port.
    #[serde(default = "default_syncport")]
    pub syncport: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            bbport: default_bbport(),
            syncport: default_syncport(),
        }
    }
}

/// Record store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path to the memory-mapped bulletin file.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Number of long-lived worker tasks servicing connections.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of the bounded admission queue between the accept loop
    /// and the workers.  The accept loop stalls when it is full.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_depth: default_queue_depth(),
        }
    }
}

/// Cluster / replication configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterConfig {
    /// List of peer addresses (`host:port`) every mutation is propagated
    /// to.  Empty means standalone: mutations commit locally.
    #[serde(default)]
    pub peers: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_bbport() -> u16 {
    9000
}

fn default_syncport() -> u16 {
    10000
}

fn default_store_path() -> String {
    "./data/bboard.db".to_string()
}

fn default_workers() -> usize {
    20
}

fn default_queue_depth() -> usize {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}
