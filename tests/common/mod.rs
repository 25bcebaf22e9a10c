use std::time::Duration;

use d_engine_mvcc::BackendConfig;
use d_engine_mvcc::MvccConfig;
use d_engine_mvcc::WatchConfig;
use d_engine_mvcc::WatchResponse;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const WAIT_FOR_RESPONSE_IN_SEC: u64 = 5;

/// Sled-backed config under `dir` with fast watch loops
pub fn test_config(dir: &TempDir) -> MvccConfig {
    MvccConfig {
        backend: BackendConfig {
            data_dir: dir.path().to_path_buf(),
            batch_interval_in_ms: 10,
            ..Default::default()
        },
        watch: WatchConfig {
            sync_interval_in_ms: 5,
            victim_retry_interval_in_ms: 1,
            ..Default::default()
        },
        ..Default::default()
    }
    .validate()
    .expect("valid test config")
}

pub async fn next_response(rx: &mut mpsc::Receiver<WatchResponse>) -> WatchResponse {
    timeout(Duration::from_secs(WAIT_FOR_RESPONSE_IN_SEC), rx.recv())
        .await
        .expect("watch response in time")
        .expect("watch channel open")
}

/// Receives responses until `count` events were collected
pub async fn collect_events(
    rx: &mut mpsc::Receiver<WatchResponse>,
    count: usize,
) -> Vec<d_engine_mvcc::Event> {
    let mut events = Vec::new();
    while events.len() < count {
        events.extend(next_response(rx).await.events);
    }
    events
}
