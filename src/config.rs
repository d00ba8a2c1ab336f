use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::coordination::semaphore::SemaphoreMode;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logical store name -> connection parameters.
    pub stores: BTreeMap<String, StoreConfig>,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub semaphores: SemaphoreConfig,
}

// ---------------------------------------------------------------------------
// KeyDB / Redis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Connection string (e.g. `rediss://keydb.local:6380`).
    pub endpoint: String,
    /// Enable TLS for the connection.
    #[serde(default = "bool_true")]
    pub tls: bool,
    /// Name of the environment variable that holds the auth token.
    #[serde(default = "default_auth_token_env")]
    pub auth_token_env: String,
    /// Database index selected on connect.
    #[serde(default)]
    pub database: Option<u8>,
    /// Decode values read through this store as UTF-8 text.  Turn off for
    /// stores that hold binary payloads.
    #[serde(default = "bool_true")]
    pub decode_responses: bool,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Upper bound (milliseconds) on any single command, including time
    /// spent waiting for a reconnect.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl StoreConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn bool_true() -> bool {
    true
}

fn default_auth_token_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_command_timeout_ms() -> u64 {
    5_000
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Fixed sleep (milliseconds) between acquisition attempts.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// How long (seconds) an acquirer waits before giving up.  Unset means
    /// wait until the holder releases or its TTL runs out.
    #[serde(default)]
    pub acquire_timeout_secs: Option<u64>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_retry_interval_ms(),
            acquire_timeout_secs: None,
        }
    }
}

impl LockConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_secs.map(Duration::from_secs)
    }
}

fn default_retry_interval_ms() -> u64 {
    100
}

// ---------------------------------------------------------------------------
// Semaphores
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SemaphoreConfig {
    #[serde(default)]
    pub mode: SemaphoreMode,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to load config file: {}", path.display()))
}

/// Parse and validate a [`Config`] from YAML text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("invalid YAML")?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(!config.stores.is_empty(), "at least one store must be configured");
    for (name, store) in &config.stores {
        anyhow::ensure!(!name.is_empty(), "store names must not be empty");
        anyhow::ensure!(
            !store.endpoint.trim().is_empty(),
            "store '{name}' has an empty endpoint"
        );
        anyhow::ensure!(store.pool_size >= 1, "store '{name}' pool_size must be >= 1");
        anyhow::ensure!(
            store.command_timeout_ms >= 1,
            "store '{name}' command_timeout_ms must be >= 1"
        );
    }
    anyhow::ensure!(
        config.locks.retry_interval_ms >= 1,
        "locks.retry_interval_ms must be >= 1"
    );
    Ok(())
}
