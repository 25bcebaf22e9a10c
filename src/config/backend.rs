use std::path::PathBuf;
use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Durable backend parameters
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackendConfig {
    /// Root directory of the sled database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Pending writes that trigger a commit of the read buffer into the engine
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Period of the background commit loop. 0 disables the loop.
    #[serde(default = "default_batch_interval")]
    pub batch_interval_in_ms: u64,

    /// sled page cache size
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity_in_bytes: u64,

    /// sled background flush period
    #[serde(default = "default_flush_every_ms")]
    pub flush_every_ms: Option<u64>,

    #[serde(default = "default_use_compression")]
    pub use_compression: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            batch_limit: default_batch_limit(),
            batch_interval_in_ms: default_batch_interval(),
            cache_capacity_in_bytes: default_cache_capacity(),
            flush_every_ms: default_flush_every_ms(),
            use_compression: default_use_compression(),
        }
    }
}

impl BackendConfig {
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "backend.data_dir cannot be empty".into(),
            )));
        }

        if self.batch_limit == 0 {
            return Err(Error::Config(ConfigError::Message(
                "backend.batch_limit must be greater than 0".into(),
            )));
        }

        if let Some(0) = self.flush_every_ms {
            return Err(Error::Config(ConfigError::Message(
                "backend.flush_every_ms must be greater than 0 when set".into(),
            )));
        }

        Ok(())
    }

    pub fn batch_interval(&self) -> Option<Duration> {
        (self.batch_interval_in_ms > 0).then(|| Duration::from_millis(self.batch_interval_in_ms))
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./db")
}
fn default_batch_limit() -> usize {
    10_000
}
// in ms
fn default_batch_interval() -> u64 {
    100
}
fn default_cache_capacity() -> u64 {
    // 64MB
    64 * 1024 * 1024
}
fn default_flush_every_ms() -> Option<u64> {
    Some(500)
}
fn default_use_compression() -> bool {
    true
}
