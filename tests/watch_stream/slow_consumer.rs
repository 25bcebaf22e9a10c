//! A consumer that stops reading loses no events.
//!
//! Scenario:
//!
//! 1. Open a stream with a channel of 4 responses and watch every key.
//! 2. Write 50 revisions without reading.
//! 3. Drain the channel.
//!
//! Expected Result:
//!
//! - All 50 events arrive exactly once, in revision order
//! - The watcher ends up synced again

use std::time::Duration;

use d_engine_mvcc::MvccConfig;
use d_engine_mvcc::WatchableStore;
use d_engine_mvcc::AUTO_WATCH_ID;
use d_engine_mvcc::KV;
use d_engine_mvcc::NO_LEASE;

use crate::common::collect_events;
use crate::common::test_config;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_consumer_receives_every_event() {
    crate::enable_logger();
    let dir = tempfile::tempdir().unwrap();
    let mut config: MvccConfig = test_config(&dir);
    config.watch.chan_buf_len = 4;
    let store = WatchableStore::open(&config, None).unwrap();

    let stream = store.new_watch_stream();
    let mut rx = stream.chan().unwrap();
    stream
        .watch(AUTO_WATCH_ID, b"", Some(b"".as_slice()), 0, Vec::new())
        .unwrap();

    for i in 0..50 {
        store.put(format!("k{i:02}").as_bytes(), b"v", NO_LEASE).unwrap();
    }

    let events = collect_events(&mut rx, 50).await;
    let revs: Vec<i64> = events.iter().map(|ev| ev.kv.mod_revision).collect();
    assert_eq!(revs, (2..=51).collect::<Vec<_>>());

    tokio::time::timeout(Duration::from_secs(5), async {
        while store.watcher_counts() != (1, 0, 0) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("watcher synced again");

    drop(stream);
    store.close().await.unwrap();
}
