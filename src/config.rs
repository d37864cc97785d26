//! TOML configuration for the collector and the agent.
//!
//! Every field has a default, so an empty file (or no file) is valid.
//! Command-line flags are applied on top by the binaries.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 53222;

/// Needs-accept batch cap.
pub const DEFAULT_BATCH_EVENTS: usize = 30;

fn read_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn socket_addr(address: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    format!("{}:{}", address, port)
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("address {}:{}: {}", address, port, e)))
}

// =============================================================================
// Collector
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub listen: ListenConfig,
    pub store: StoreConfig,
    pub workers: WorkerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub address: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub connect_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            connect_attempts: 5,
            backoff_base_ms: 1000,
        }
    }
}

impl StoreConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("logship"))
        .unwrap_or_else(|| PathBuf::from("./logship-data"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub threads: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: num_cpus::get().clamp(1, 4),
        }
    }
}

impl CollectorConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config: Self = match path {
            Some(p) => read_toml(p)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        if self.workers.threads == 0 {
            return Err(ConfigError::Invalid("workers.threads must be at least 1".into()));
        }
        if self.store.connect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "store.connect_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        socket_addr(&self.listen.address, self.listen.port)
    }
}

// =============================================================================
// Agent
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server: ServerConfig,
    pub batch: BatchConfig,
    pub source: SourceConfig,
    pub reconnect: ReconnectConfig,
    pub identity: IdentityConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_events: usize,
    /// Idle poll interval for new events
    pub poll_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_events: DEFAULT_BATCH_EVENTS,
            poll_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Newline-delimited JSON event file
    pub path: PathBuf,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("events.jsonl"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub client_name: Option<String>,
}

impl AgentConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config: Self = match path {
            Some(p) => read_toml(p)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch.max_events == 0 {
            return Err(ConfigError::Invalid("batch.max_events must be at least 1".into()));
        }
        if self.batch.poll_ms == 0 {
            return Err(ConfigError::Invalid("batch.poll_ms must be at least 1".into()));
        }
        if self.reconnect.initial_ms == 0 || self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(ConfigError::Invalid(format!(
                "reconnect backoff {}ms..{}ms is not a valid range",
                self.reconnect.initial_ms, self.reconnect.max_ms
            )));
        }
        Ok(())
    }

    /// `address:port` of the collector, resolved at connect time.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.address, self.server.port)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.batch.poll_ms)
    }
}
