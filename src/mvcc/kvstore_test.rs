use std::sync::Arc;

use super::*;
use crate::test_utils::enable_logger;
use crate::test_utils::mem_store;
use crate::Backend;
use crate::Error;
use crate::LeaseError;
use crate::MvccError;
use crate::ReadTxMode;
use crate::StoreConfig;
use crate::SystemError;

fn get(
    store: &Store,
    key: &[u8],
    rev: i64,
) -> crate::Result<Vec<KeyValue>> {
    Ok(store
        .range(key, None, RangeOptions {
            rev,
            ..Default::default()
        })?
        .kvs)
}

#[test]
fn test_put_assigns_increasing_revisions() {
    enable_logger();
    let store = mem_store(None);
    assert_eq!(store.rev(), 1);

    assert_eq!(store.put(b"foo", b"bar", NO_LEASE).unwrap(), 2);
    assert_eq!(store.put(b"foo", b"bar1", NO_LEASE).unwrap(), 3);
    assert_eq!(store.put(b"foo", b"bar2", NO_LEASE).unwrap(), 4);
    assert_eq!(store.rev(), 4);

    let kvs = get(&store, b"foo", 0).unwrap();
    assert_eq!(
        kvs,
        vec![KeyValue {
            key: b"foo".to_vec(),
            create_revision: 2,
            mod_revision: 4,
            version: 3,
            value: b"bar2".to_vec(),
            lease: NO_LEASE,
        }]
    );
}

#[test]
fn test_changes_of_one_txn_share_a_revision() {
    let store = mem_store(None);

    let mut txn = store.write();
    assert_eq!(txn.put(b"a", b"1", NO_LEASE).unwrap(), 2);
    assert_eq!(txn.put(b"b", b"2", NO_LEASE).unwrap(), 2);
    assert_eq!(txn.changes().len(), 2);

    // own writes are visible before the end
    let own = txn.range(b"a", None, RangeOptions::default()).unwrap();
    assert_eq!(own.kvs[0].value, b"1".to_vec());
    txn.end().unwrap();

    assert_eq!(store.rev(), 2);
    let result = store
        .range(b"a", Some(b"c".as_slice()), RangeOptions::default())
        .unwrap();
    assert_eq!(result.rev, 2);
    assert_eq!(result.kvs.len(), 2);
    assert!(result.kvs.iter().all(|kv| kv.mod_revision == 2));
}

#[test]
fn test_txn_without_changes_keeps_revision() {
    let store = mem_store(None);

    let txn = store.write();
    txn.end().unwrap();
    assert_eq!(store.rev(), 1);

    assert_eq!(store.delete_range(b"missing", None).unwrap(), (0, 1));
    assert_eq!(store.rev(), 1);
}

#[test]
fn test_delete_range() {
    let store = mem_store(None);
    store.put(b"foo", b"bar", NO_LEASE).unwrap();
    store.put(b"foo1", b"bar", NO_LEASE).unwrap();
    store.put(b"zoo", b"bar", NO_LEASE).unwrap();

    assert_eq!(
        store.delete_range(b"foo", Some(b"fop".as_slice())).unwrap(),
        (2, 5)
    );

    let result = store
        .range(b"foo", Some(b"fop".as_slice()), RangeOptions::default())
        .unwrap();
    assert!(result.kvs.is_empty());
    assert_eq!(get(&store, b"zoo", 0).unwrap().len(), 1);

    // deleted keys stay readable in the past
    assert_eq!(get(&store, b"foo1", 4).unwrap().len(), 1);

    assert_eq!(
        store.delete_range(b"foo", Some(b"fop".as_slice())).unwrap(),
        (0, 5)
    );
}

#[test]
fn test_read_txn_keeps_its_revision() {
    let store = mem_store(None);
    store.put(b"foo", b"v1", NO_LEASE).unwrap();

    let txn = store.read(ReadTxMode::Concurrent);
    store.put(b"foo", b"v2", NO_LEASE).unwrap();

    assert_eq!(txn.rev(), 2);
    let kvs = txn.range(b"foo", None, RangeOptions::default()).unwrap().kvs;
    assert_eq!(kvs[0].value, b"v1".to_vec());
    assert_eq!((kvs[0].create_revision, kvs[0].mod_revision, kvs[0].version), (2, 2, 1));

    // reading past the txn revision is reading the future
    let err = txn
        .range(b"foo", None, RangeOptions {
            rev: 3,
            ..Default::default()
        })
        .unwrap_err();
    assert_eq!(
        err.as_mvcc(),
        Some(&MvccError::FutureRevision {
            revision: 3,
            current: 2
        })
    );
    txn.end().unwrap();

    let kvs = get(&store, b"foo", 0).unwrap();
    assert_eq!((kvs[0].create_revision, kvs[0].mod_revision, kvs[0].version), (2, 3, 2));
}

#[test]
fn test_recreated_key_starts_new_generation() {
    let store = mem_store(None);
    store.put(b"foo", b"a", NO_LEASE).unwrap(); // 2
    store.put(b"foo", b"b", NO_LEASE).unwrap(); // 3
    store.delete_range(b"foo", None).unwrap(); // 4
    store.put(b"foo", b"c", NO_LEASE).unwrap(); // 5
    store.put(b"foo", b"d", NO_LEASE).unwrap(); // 6

    assert!(get(&store, b"foo", 4).unwrap().is_empty());

    let old = get(&store, b"foo", 3).unwrap();
    assert_eq!((old[0].create_revision, old[0].version), (2, 2));

    let new = get(&store, b"foo", 6).unwrap();
    assert_eq!((new[0].create_revision, new[0].mod_revision, new[0].version), (5, 6, 2));
}

#[test]
fn test_range_limit_and_count() {
    let store = mem_store(None);
    for key in [b"a", b"b", b"c"] {
        store.put(key, b"v", NO_LEASE).unwrap();
    }

    let limited = store
        .range(b"a", Some(b"".as_slice()), RangeOptions {
            limit: 2,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(limited.kvs.len(), 2);
    assert_eq!(limited.count, 3);
    assert_eq!(limited.kvs[1].key, b"b".to_vec());

    let counted = store
        .range(b"a", Some(b"".as_slice()), RangeOptions {
            count: true,
            ..Default::default()
        })
        .unwrap();
    assert!(counted.kvs.is_empty());
    assert_eq!(counted.count, 3);
}

#[test]
fn test_compact() {
    enable_logger();
    let store = mem_store(None);
    store.put(b"foo", b"v1", NO_LEASE).unwrap(); // 2
    store.put(b"foo", b"v2", NO_LEASE).unwrap(); // 3
    store.put(b"foo", b"v3", NO_LEASE).unwrap(); // 4

    store.compact(3).unwrap();
    assert_eq!(store.compact_rev(), 3);

    let err = get(&store, b"foo", 2).unwrap_err();
    assert_eq!(err.as_mvcc(), Some(&MvccError::Compacted { compact_revision: 3 }));
    assert_eq!(get(&store, b"foo", 3).unwrap()[0].value, b"v2".to_vec());
    assert_eq!(get(&store, b"foo", 4).unwrap()[0].value, b"v3".to_vec());

    let err = store.compact(3).unwrap_err();
    assert_eq!(err.as_mvcc(), Some(&MvccError::Compacted { compact_revision: 3 }));
    let err = store.compact(10).unwrap_err();
    assert_eq!(
        err.as_mvcc(),
        Some(&MvccError::FutureRevision {
            revision: 10,
            current: 4
        })
    );
}

#[test]
fn test_compact_drops_deleted_keys() {
    let store = mem_store(None);
    store.put(b"foo", b"v1", NO_LEASE).unwrap(); // 2
    store.delete_range(b"foo", None).unwrap(); // 3
    store.put(b"bar", b"v1", NO_LEASE).unwrap(); // 4

    store.compact(4).unwrap();

    assert!(store.kv_index.get(b"foo", 4).is_err());
    let result = store
        .range(b"", Some(b"".as_slice()), RangeOptions::default())
        .unwrap();
    assert_eq!(result.kvs.len(), 1);
    assert_eq!(result.kvs[0].key, b"bar".to_vec());
}

#[test]
fn test_restore_from_sled() {
    enable_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = crate::test_utils::sled_config(&dir);

    {
        let backend = Arc::new(Backend::open(&config.backend).unwrap());
        let store = Store::new(backend, None, StoreConfig::default()).unwrap();
        store.put(b"foo", b"v1", NO_LEASE).unwrap(); // 2
        store.put(b"foo", b"v2", NO_LEASE).unwrap(); // 3
        store.put(b"bar", b"v1", NO_LEASE).unwrap(); // 4
        store.delete_range(b"bar", None).unwrap(); // 5
        store.put(b"baz", b"v1", NO_LEASE).unwrap(); // 6
        store.compact(3).unwrap();
        store.close().unwrap();
    }

    let backend = Arc::new(Backend::open(&config.backend).unwrap());
    let store = Store::new(backend, None, StoreConfig::default()).unwrap();

    assert_eq!(store.rev(), 6);
    assert_eq!(store.compact_rev(), 3);

    let foo = get(&store, b"foo", 0).unwrap();
    assert_eq!((foo[0].create_revision, foo[0].mod_revision, foo[0].version), (2, 3, 2));
    assert!(get(&store, b"bar", 0).unwrap().is_empty());
    assert_eq!(get(&store, b"bar", 4).unwrap()[0].value, b"v1".to_vec());

    // the restored index keeps counting versions
    store.put(b"foo", b"v3", NO_LEASE).unwrap();
    let foo = get(&store, b"foo", 0).unwrap();
    assert_eq!((foo[0].mod_revision, foo[0].version), (7, 3));
}

#[test]
fn test_put_and_delete_move_keys_between_leases() {
    let lessor = Arc::new(MemLessor::new());
    lessor.grant(7);
    let store = mem_store(Some(lessor.clone() as Arc<dyn Lessor>));

    store.put(b"foo", b"v1", 7).unwrap();
    assert_eq!(lessor.get_lease(&LeaseItem::new(b"foo")), 7);
    assert_eq!(get(&store, b"foo", 0).unwrap()[0].lease, 7);

    // the same lease stays attached across puts
    store.put(b"foo", b"v2", 7).unwrap();
    assert_eq!(lessor.keys(7), vec![b"foo".to_vec()]);

    store.put(b"foo", b"v3", NO_LEASE).unwrap();
    assert_eq!(lessor.get_lease(&LeaseItem::new(b"foo")), NO_LEASE);

    store.put(b"foo", b"v4", 7).unwrap();
    store.delete_range(b"foo", None).unwrap();
    assert!(lessor.keys(7).is_empty());
}

#[test]
fn test_put_fails_when_lease_cannot_be_attached() {
    let mut lessor = MockLessor::new();
    lessor.expect_get_lease().returning(|_| NO_LEASE);
    lessor
        .expect_attach()
        .times(1)
        .returning(|id, _| Err(LeaseError::LeaseNotFound(id).into()));
    let store = mem_store(Some(Arc::new(lessor)));

    let err = store.put(b"foo", b"bar", 9).unwrap_err();
    assert!(matches!(
        err,
        Error::System(SystemError::Lease(LeaseError::LeaseNotFound(9)))
    ));
    assert_eq!(store.rev(), 1);
    assert!(get(&store, b"foo", 0).unwrap().is_empty());
}

#[test]
fn test_every_revision_matches_model() {
    use std::collections::BTreeMap;

    use rand::rngs::StdRng;
    use rand::Rng;
    use rand::SeedableRng;

    let store = mem_store(None);
    let mut rng = StdRng::seed_from_u64(7);
    // history[rev] is the expected content at `rev`
    let mut history: Vec<BTreeMap<Vec<u8>, Vec<u8>>> = vec![BTreeMap::new(), BTreeMap::new()];

    for i in 0..200 {
        let key = format!("k{}", rng.gen_range(0..6)).into_bytes();
        let mut state = history.last().cloned().unwrap_or_default();

        if rng.gen_bool(0.7) {
            let value = format!("v{i}").into_bytes();
            store.put(&key, &value, NO_LEASE).unwrap();
            state.insert(key, value);
        } else {
            let (n, _) = store.delete_range(&key, None).unwrap();
            assert_eq!(n == 1, state.remove(&key).is_some());
            if n == 0 {
                continue;
            }
        }
        history.push(state);
        assert_eq!(store.rev() as usize, history.len() - 1);
    }

    for (rev, expected) in history.iter().enumerate().skip(1) {
        let result = store
            .range(b"", Some(b"".as_slice()), RangeOptions {
                rev: rev as i64,
                ..Default::default()
            })
            .unwrap();
        let actual: BTreeMap<Vec<u8>, Vec<u8>> =
            result.kvs.into_iter().map(|kv| (kv.key, kv.value)).collect();
        assert_eq!(&actual, expected, "content at revision {rev}");
    }
}
