use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Transactional store parameters
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConfig {
    /// Maximum backend records removed per compaction batch
    #[serde(default = "default_compaction_batch_limit")]
    pub compaction_batch_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            compaction_batch_limit: default_compaction_batch_limit(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.compaction_batch_limit == 0 {
            return Err(Error::Config(ConfigError::Message(
                "store.compaction_batch_limit must be greater than 0".into(),
            )));
        }
        Ok(())
    }
}

fn default_compaction_batch_limit() -> usize {
    1000
}
