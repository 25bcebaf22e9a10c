//! A watcher created after a restart replays history written before it.
//!
//! Scenario:
//!
//! 1. Open a sled-backed watchable store and write 10 revisions.
//! 2. Close the store and open it again from the same directory.
//! 3. Watch every key from revision 2 and write one more revision.
//!
//! Expected Result:
//!
//! - The reopened store starts at revision 11
//! - The watcher receives all 11 events in revision order

use d_engine_mvcc::EventType;
use d_engine_mvcc::WatchableStore;
use d_engine_mvcc::AUTO_WATCH_ID;
use d_engine_mvcc::KV;
use d_engine_mvcc::NO_LEASE;

use crate::common::collect_events;
use crate::common::test_config;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_history_replay_after_restart() {
    crate::enable_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    // 1. Write history
    {
        let store = WatchableStore::open(&config, None).unwrap();
        for i in 0..10 {
            let key = format!("key-{}", i % 3);
            store.put(key.as_bytes(), format!("v{i}").as_bytes(), NO_LEASE).unwrap();
        }
        assert_eq!(store.rev(), 11);
        store.close().await.unwrap();
    }

    // 2. Reopen
    let store = WatchableStore::open(&config, None).unwrap();
    assert_eq!(store.rev(), 11);

    // 3. Replay and follow
    let stream = store.new_watch_stream();
    let mut rx = stream.chan().unwrap();
    stream
        .watch(AUTO_WATCH_ID, b"key-", Some(b"key.".as_slice()), 2, Vec::new())
        .unwrap();
    let replayed = collect_events(&mut rx, 10).await;

    store.delete_range(b"key-0", None).unwrap();
    let live = collect_events(&mut rx, 1).await;

    let revs: Vec<i64> = replayed.iter().map(|ev| ev.kv.mod_revision).collect();
    assert_eq!(revs, (2..=11).collect::<Vec<_>>());
    assert_eq!(live[0].event_type, EventType::Delete);
    assert_eq!(live[0].kv.mod_revision, 12);

    drop(stream);
    store.close().await.unwrap();
}
