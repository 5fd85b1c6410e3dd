//! Configuration: TOML file plus environment overrides.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::daemon::{BroadcasterLimits, SyncPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub relayer: RelayerConfig,
    pub ledger: LedgerConfig,
    pub sync: SyncConfig,
    pub store: StoreConfig,
    pub broadcast: BroadcastConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayerConfig {
    pub endpoint: String,
    pub timeout_ms: u64,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8700/relayer".to_string(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub rpc_endpoint: String,
    pub contract_address: String,
    pub timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_endpoint: "http://127.0.0.1:8545".to_string(),
            contract_address: String::new(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Periodic sweep interval, independent of backoff.
    pub tick_interval_secs: u64,
    /// Enqueue-trigger debounce.
    pub debounce_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_cap_ms: 60_000,
            tick_interval_secs: 30,
            debounce_ms: 250,
        }
    }
}

impl SyncConfig {
    pub fn policy(&self) -> SyncPolicy {
        SyncPolicy {
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.backoff_cap_ms),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("parttrail-data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub max_subscribers: usize,
    pub subscriber_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        let limits = BroadcasterLimits::default();
        Self {
            max_subscribers: limits.max_subscribers,
            subscriber_capacity: limits.subscriber_capacity,
        }
    }
}

impl BroadcastConfig {
    pub fn limits(&self) -> BroadcasterLimits {
        BroadcasterLimits {
            max_subscribers: self.max_subscribers,
            subscriber_capacity: self.subscriber_capacity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Tracing filter directive, e.g. "info" or "parttrail=debug".
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from a TOML file, then apply `PARTTRAIL_*` environment
    /// overrides. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = env_var("PARTTRAIL_RELAYER_ENDPOINT") {
            self.relayer.endpoint = value;
        }
        if let Some(value) = env_var("PARTTRAIL_LEDGER_RPC_ENDPOINT") {
            self.ledger.rpc_endpoint = value;
        }
        if let Some(value) = env_var("PARTTRAIL_LEDGER_CONTRACT") {
            self.ledger.contract_address = value;
        }
        if let Some(value) = env_var("PARTTRAIL_STORE_DIR") {
            self.store.dir = PathBuf::from(value);
        }
        if let Some(value) = env_var("PARTTRAIL_LOG") {
            self.logging.filter = value;
        }
        if let Some(value) = env_var("PARTTRAIL_MAX_ATTEMPTS") {
            if let Ok(parsed) = value.parse() {
                self.sync.max_attempts = parsed;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "sync.max_attempts must be > 0".to_string(),
            ));
        }
        if self.relayer.endpoint.is_empty() {
            return Err(ConfigError::Invalid(
                "relayer.endpoint must not be empty".to_string(),
            ));
        }
        if self.broadcast.max_subscribers == 0 || self.broadcast.subscriber_capacity == 0 {
            return Err(ConfigError::Invalid(
                "broadcast limits must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.sync.max_attempts, 3);
        assert_eq!(config.sync.tick_interval(), Duration::from_secs(30));
        assert_eq!(config.sync.policy().backoff_base, Duration::from_millis(500));
    }

    #[test]
    fn partial_file_keeps_defaults_for_rest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[relayer]\nendpoint = \"http://relay.example:9000\"\n\n[sync]\nmax_attempts = 5\n",
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.relayer.endpoint, "http://relay.example:9000");
        assert_eq!(config.sync.max_attempts, 5);
        assert_eq!(config.sync.backoff_base_ms, 500);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn zero_max_attempts_is_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[sync]\nmax_attempts = 0\n").unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "not toml at all [").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    }
}
