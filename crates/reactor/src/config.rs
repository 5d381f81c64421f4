use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Name this node announces to peers; also the default `remote_name`
    /// peers record for operations received from it
    pub node_name: String,
    pub sync_addr: String,
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub max_concurrency: usize,
    pub job_timeout_ms: u64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            job_timeout_ms: 30_000,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub poll_interval_ms: u64,
    pub push_interval_ms: u64,
    /// Consecutive push failures tolerated before dead-lettering the batch
    pub push_max_failures: u32,
    /// Local operations newer than an inbound batch before a reshuffle is
    /// attempted instead of a plain apply
    pub reshuffle_threshold: usize,
    pub reshuffle_max_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            push_interval_ms: 100,
            push_max_failures: 5,
            reshuffle_threshold: 1_000,
            reshuffle_max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub sqlite_cache_size: i32,
    pub sqlite_busy_timeout: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_cache_size: 10_000,
            sqlite_busy_timeout: 5_000,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        settings.try_deserialize()
    }
}
