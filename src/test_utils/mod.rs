//! Helpers shared by the unit tests of every module
use std::sync::Arc;

use tempfile::TempDir;

use crate::Backend;
use crate::BackendConfig;
use crate::Lessor;
use crate::MemStorageEngine;
use crate::MvccConfig;
use crate::Store;
use crate::StoreConfig;
use crate::WatchableStore;

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
    println!("setup logger for unit test.");
}

pub(crate) fn mem_backend() -> Arc<Backend> {
    Arc::new(Backend::new(Arc::new(MemStorageEngine::new()), 10_000).expect("mem backend"))
}

pub(crate) fn mem_store(lessor: Option<Arc<dyn Lessor>>) -> Store {
    Store::new(mem_backend(), lessor, StoreConfig::default()).expect("open store")
}

/// Config for a sled store under `dir`, with the commit loop disabled
pub(crate) fn sled_config(dir: &TempDir) -> MvccConfig {
    MvccConfig {
        backend: BackendConfig {
            data_dir: dir.path().to_path_buf(),
            batch_interval_in_ms: 0,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Watchable store over a fresh in-memory backend; needs a tokio runtime
pub(crate) fn mem_watchable_store(config: &MvccConfig) -> WatchableStore {
    WatchableStore::new(mem_backend(), None, config).expect("open watchable store")
}

/// Watch settings that make the background loops spin fast in tests
pub(crate) fn fast_watch_config() -> MvccConfig {
    let mut config = MvccConfig::default();
    config.backend.batch_interval_in_ms = 0;
    config.watch.sync_interval_in_ms = 5;
    config.watch.victim_retry_interval_in_ms = 1;
    config
}
