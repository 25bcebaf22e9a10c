use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Watch scheduler parameters
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatchConfig {
    /// Capacity of each watch stream's response channel
    #[serde(default = "default_chan_buf_len")]
    pub chan_buf_len: usize,

    /// Number of unsynced watchers caught up in a single sync pass
    #[serde(default = "default_max_watchers_per_sync")]
    pub max_watchers_per_sync: usize,

    /// Period of the unsynced watcher loop
    #[serde(default = "default_sync_interval")]
    pub sync_interval_in_ms: u64,

    /// Retry period of the victim loop while victims exist
    #[serde(default = "default_victim_retry_interval")]
    pub victim_retry_interval_in_ms: u64,

    /// Distinct revisions delivered to one watcher per response
    #[serde(default = "default_watch_batch_max_revs")]
    pub watch_batch_max_revs: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            chan_buf_len: default_chan_buf_len(),
            max_watchers_per_sync: default_max_watchers_per_sync(),
            sync_interval_in_ms: default_sync_interval(),
            victim_retry_interval_in_ms: default_victim_retry_interval(),
            watch_batch_max_revs: default_watch_batch_max_revs(),
        }
    }
}

impl WatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chan_buf_len == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.chan_buf_len must be greater than 0".into(),
            )));
        }

        if self.max_watchers_per_sync == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.max_watchers_per_sync must be greater than 0".into(),
            )));
        }

        if self.sync_interval_in_ms == 0 || self.victim_retry_interval_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch loop intervals must be at least 1ms".into(),
            )));
        }

        if self.watch_batch_max_revs == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.watch_batch_max_revs must be greater than 0".into(),
            )));
        }

        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_in_ms)
    }

    pub fn victim_retry_interval(&self) -> Duration {
        Duration::from_millis(self.victim_retry_interval_in_ms)
    }
}

fn default_chan_buf_len() -> usize {
    128
}
fn default_max_watchers_per_sync() -> usize {
    512
}
// in ms
fn default_sync_interval() -> u64 {
    100
}
// in ms
fn default_victim_retry_interval() -> u64 {
    10
}
fn default_watch_batch_max_revs() -> usize {
    1000
}
