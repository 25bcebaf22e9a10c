//! Compaction state and surviving records are restored on reopen.
//!
//! Scenario:
//!
//! 1. Write three versions of `foo`, delete `bar`, compact at revision 4.
//! 2. Reopen the store.
//! 3. Read below, at and above the compaction revision; watch from before it.
//!
//! Expected Result:
//!
//! - Reads below revision 4 fail as compacted
//! - `foo` keeps its create revision and version count
//! - A watcher starting before the compaction revision is told so

use d_engine_mvcc::MvccError;
use d_engine_mvcc::RangeOptions;
use d_engine_mvcc::WatchableStore;
use d_engine_mvcc::AUTO_WATCH_ID;
use d_engine_mvcc::KV;
use d_engine_mvcc::NO_LEASE;

use crate::common::next_response;
use crate::common::test_config;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_compaction_survives_restart() {
    crate::enable_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    // 1. History and compaction
    {
        let store = WatchableStore::open(&config, None).unwrap();
        store.put(b"foo", b"v1", NO_LEASE).unwrap(); // 2
        store.put(b"bar", b"v1", NO_LEASE).unwrap(); // 3
        store.put(b"foo", b"v2", NO_LEASE).unwrap(); // 4
        store.delete_range(b"bar", None).unwrap(); // 5
        store.put(b"foo", b"v3", NO_LEASE).unwrap(); // 6
        store.compact(4).unwrap();
        store.close().await.unwrap();
    }

    // 2. Reopen
    let store = WatchableStore::open(&config, None).unwrap();
    assert_eq!(store.rev(), 6);
    assert_eq!(store.compact_rev(), 4);

    // 3. Reads around the compaction revision
    let err = store
        .range(b"foo", None, RangeOptions {
            rev: 3,
            ..Default::default()
        })
        .unwrap_err();
    assert_eq!(err.as_mvcc(), Some(&MvccError::Compacted { compact_revision: 4 }));

    let at = store
        .range(b"foo", None, RangeOptions {
            rev: 4,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(at.kvs[0].value, b"v2".to_vec());

    let now = store.range(b"foo", None, RangeOptions::default()).unwrap();
    assert_eq!(now.kvs[0].create_revision, 2);
    assert_eq!(now.kvs[0].version, 3);
    assert!(store
        .range(b"bar", None, RangeOptions::default())
        .unwrap()
        .kvs
        .is_empty());

    let stream = store.new_watch_stream();
    let mut rx = stream.chan().unwrap();
    stream
        .watch(AUTO_WATCH_ID, b"foo", None, 2, Vec::new())
        .unwrap();
    assert_eq!(next_response(&mut rx).await.compact_revision, 4);

    drop(stream);
    store.close().await.unwrap();
}
