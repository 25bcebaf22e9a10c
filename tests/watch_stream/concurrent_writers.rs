//! Watchers observe writes from concurrent writers as one ordered history.
//!
//! Scenario:
//!
//! 1. Start a watcher on every key.
//! 2. Run 4 writer tasks putting 25 keys each.
//!
//! Expected Result:
//!
//! - The watcher receives 100 events with strictly increasing revisions
//! - The store revision is 101

use std::sync::Arc;

use d_engine_mvcc::WatchableStore;
use d_engine_mvcc::AUTO_WATCH_ID;
use d_engine_mvcc::KV;
use d_engine_mvcc::NO_LEASE;

use crate::common::collect_events;
use crate::common::test_config;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_are_serialized() {
    crate::enable_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let store = Arc::new(WatchableStore::open(&config, None).unwrap());

    let stream = store.new_watch_stream();
    let mut rx = stream.chan().unwrap();
    stream
        .watch(AUTO_WATCH_ID, b"", Some(b"".as_slice()), 0, Vec::new())
        .unwrap();

    let mut writers = Vec::new();
    for w in 0..4 {
        let store = store.clone();
        writers.push(tokio::task::spawn_blocking(move || {
            for i in 0..25 {
                store
                    .put(format!("w{w}-{i}").as_bytes(), b"v", NO_LEASE)
                    .unwrap();
            }
        }));
    }

    let events = collect_events(&mut rx, 100).await;
    for writer in writers {
        writer.await.unwrap();
    }

    assert!(events
        .windows(2)
        .all(|pair| pair[0].kv.mod_revision < pair[1].kv.mod_revision));
    assert_eq!(store.rev(), 101);

    drop(stream);
    store.close().await.unwrap();
}
