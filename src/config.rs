//! Server configuration.
//!
//! All sections are serde-friendly so deployments can load them from JSON
//! or TOML files; every field has a default, so a partial file (or none at
//! all) yields a working configuration.

use crate::error::{KvError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Durability mode for the append-only log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AofMode {
    /// Never sync; the OS decides when data reaches disk.
    #[serde(alias = "none")]
    No,
    /// fdatasync on an interval (default one second).
    #[default]
    #[serde(alias = "everysec")]
    EverySecond,
    /// fdatasync before the client sees a reply.
    Always,
}

impl AofMode {
    /// The `appendfsync` spelling reported by `CONFIG GET`.
    pub fn as_config_str(&self) -> &'static str {
        match self {
            AofMode::No => "no",
            AofMode::EverySecond => "everysec",
            AofMode::Always => "always",
        }
    }
}

/// Append-only log options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AofOptions {
    pub enabled: bool,
    pub mode: AofMode,
    pub dir: PathBuf,
    pub filename: String,
    /// Target bytes per aggregated write batch.
    pub batch_bytes: usize,
    /// Upper bound on how long the writer waits to aggregate a batch.
    pub batch_wait_us: u64,
    /// Best-effort preallocation to reduce metadata churn.
    pub prealloc_bytes: u64,
    /// Actual sync period for `EverySecond`.
    pub sync_interval_ms: u64,
}

impl Default for AofOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: AofMode::default(),
            dir: PathBuf::from("./data"),
            filename: "appendonly.aof".to_string(),
            batch_bytes: 256 * 1024,
            batch_wait_us: 1500,
            prealloc_bytes: 64 * 1024 * 1024,
            sync_interval_ms: 1000,
        }
    }
}

impl AofOptions {
    /// Full path of the append-only log file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }

    /// Path of the temporary file used by the background rewrite.
    pub fn rewrite_tmp_path(&self) -> PathBuf {
        self.dir.join(format!("{}.rewrite.tmp", self.filename))
    }
}

/// Snapshot (RDB) options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RdbOptions {
    pub enabled: bool,
    pub dir: PathBuf,
    pub filename: String,
}

impl Default for RdbOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("./data"),
            filename: "dump.rdb".to_string(),
        }
    }
}

impl RdbOptions {
    /// Full path of the snapshot file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }
}

/// Replica-mode options; when enabled, the server follows a primary.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ReplicaOptions {
    pub enabled: bool,
    pub primary_host: String,
    pub primary_port: u16,
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub bind_address: String,
    pub aof: AofOptions,
    pub rdb: RdbOptions,
    pub replica: ReplicaOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 6379,
            bind_address: "0.0.0.0".to_string(),
            aof: AofOptions::default(),
            rdb: RdbOptions::default(),
            replica: ReplicaOptions::default(),
        }
    }
}

impl ServerConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.aof.batch_bytes == 0 {
            return Err(KvError::Config(
                "aof.batch_bytes must be greater than zero".to_string(),
            ));
        }
        if self.aof.sync_interval_ms == 0 {
            return Err(KvError::Config(
                "aof.sync_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.aof.filename.is_empty() {
            return Err(KvError::Config("aof.filename must not be empty".to_string()));
        }
        if self.rdb.filename.is_empty() {
            return Err(KvError::Config("rdb.filename must not be empty".to_string()));
        }
        if self.replica.enabled
            && (self.replica.primary_host.is_empty() || self.replica.primary_port == 0)
        {
            return Err(KvError::Config(
                "replica mode requires primary_host and primary_port".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ServerConfig =
            serde_json::from_str(json).map_err(|e| KvError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: ServerConfig =
            toml::from_str(toml_str).map_err(|e| KvError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Socket address the listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}
