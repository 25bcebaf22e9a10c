use tokio::sync::mpsc;

use super::*;

fn put_event(
    key: &[u8],
    rev: i64,
) -> Event {
    Event {
        event_type: EventType::Put,
        kv: KeyValue {
            key: key.to_vec(),
            create_revision: rev,
            mod_revision: rev,
            version: 1,
            value: b"v".to_vec(),
            lease: NO_LEASE,
        },
    }
}

fn delete_event(
    key: &[u8],
    rev: i64,
) -> Event {
    Event {
        event_type: EventType::Delete,
        kv: KeyValue {
            key: key.to_vec(),
            mod_revision: rev,
            ..Default::default()
        },
    }
}

fn new_watcher(
    id: WatchId,
    key: &[u8],
    end: Option<&[u8]>,
    min_rev: i64,
    cap: usize,
) -> (Watcher, mpsc::Receiver<WatchResponse>) {
    let (tx, rx) = mpsc::channel(cap);
    let w = Watcher {
        key: key.to_vec(),
        end: end.map(<[u8]>::to_vec),
        min_rev,
        id,
        filters: Vec::new(),
        tx,
    };
    (w, rx)
}

#[test]
fn test_watcher_contains() {
    let (single, _rx1) = new_watcher(1, b"foo", None, 0, 1);
    let (range, _rx2) = new_watcher(2, b"foo", Some(b"fop".as_slice()), 0, 1);
    let (open, _rx3) = new_watcher(3, b"foo", Some(b"".as_slice()), 0, 1);

    assert!(single.contains(b"foo"));
    assert!(!single.contains(b"foo1"));

    assert!(range.contains(b"foo"));
    assert!(range.contains(b"foo1"));
    assert!(!range.contains(b"fop"));
    assert!(!range.contains(b"fo"));

    assert!(open.contains(b"zzz"));
    assert!(!open.contains(b"a"));
}

#[test]
fn test_event_batch_stops_at_max_revs() {
    let mut eb = EventBatch::default();
    for ev in [
        put_event(b"a", 1),
        put_event(b"b", 1),
        put_event(b"a", 2),
        put_event(b"a", 3),
        put_event(b"a", 4),
    ] {
        eb.add(ev, 2);
    }

    assert_eq!(eb.evs.len(), 3);
    assert_eq!(eb.revs, 3);
    assert_eq!(eb.more_rev, 3);
}

#[test]
fn test_group_add_and_remove() {
    let mut wg = WatcherGroup::default();
    let (w1, _rx1) = new_watcher(1, b"foo", None, 0, 1);
    let (w2, _rx2) = new_watcher(2, b"a", Some(b"g".as_slice()), 0, 1);
    wg.add(10, w1);
    wg.add(11, w2);

    assert_eq!(wg.len(), 2);
    assert!(wg.contains_key(b"foo"));
    assert!(wg.contains_key(b"bar"));
    assert!(!wg.contains_key(b"zoo"));

    let mut handles = wg.watcher_set_by_key(b"foo");
    handles.sort();
    assert_eq!(handles, vec![10, 11]);

    assert_eq!(wg.remove(11).map(|w| w.id), Some(2));
    assert!(wg.remove(11).is_none());
    assert!(!wg.contains_key(b"bar"));
    assert!(wg.contains(10));
}

#[test]
fn test_new_watcher_batch_skips_delivered_revisions() {
    let mut wg = WatcherGroup::default();
    let (w1, _rx1) = new_watcher(1, b"foo", None, 3, 1);
    let (w2, _rx2) = new_watcher(2, b"", Some(b"".as_slice()), 1, 1);
    wg.add(1, w1);
    wg.add(2, w2);

    let evs = vec![put_event(b"foo", 2), put_event(b"bar", 3), delete_event(b"foo", 4)];
    let wb = wg.new_watcher_batch(&evs, 100);

    assert_eq!(wb[&1].evs, vec![delete_event(b"foo", 4)]);
    assert_eq!(wb[&2].evs.len(), 3);
    assert_eq!(wb[&2].revs, 3);
}

#[test]
fn test_choose_removes_compacted_watchers() {
    let mut wg = WatcherGroup::default();
    let (behind, mut rx1) = new_watcher(1, b"foo", None, 2, 1);
    let (w2, _rx2) = new_watcher(2, b"foo", None, 6, 1);
    let (w3, _rx3) = new_watcher(3, b"bar", None, 8, 1);
    wg.add(1, behind);
    wg.add(2, w2);
    wg.add(3, w3);

    let (chosen, min_rev, compacted) = wg.choose(10, 9, 5);

    assert_eq!(compacted, vec![1]);
    assert_eq!(min_rev, 6);
    assert_eq!(chosen.len(), 2);
    assert!(wg.is_empty());

    let wr = rx1.try_recv().unwrap();
    assert_eq!(wr.watch_id, 1);
    assert_eq!(wr.compact_revision, 5);
}

#[test]
fn test_choose_keeps_compacted_watcher_with_full_channel() {
    let mut wg = WatcherGroup::default();
    let (behind, _rx) = new_watcher(1, b"foo", None, 2, 1);
    behind
        .tx
        .try_send(WatchResponse::default())
        .expect("channel has room");
    wg.add(1, behind);

    let (chosen, _, compacted) = wg.choose(10, 9, 5);

    assert!(chosen.is_empty());
    assert!(compacted.is_empty());
    assert!(wg.contains(1));
}

#[test]
fn test_choose_respects_max_watchers() {
    let mut wg = WatcherGroup::default();
    let mut receivers = Vec::new();
    for handle in 0..5 {
        let (w, rx) = new_watcher(handle as WatchId, b"foo", None, 1, 1);
        receivers.push(rx);
        wg.add(handle, w);
    }

    let (chosen, min_rev, _) = wg.choose(2, 9, -1);
    assert_eq!(chosen.len(), 2);
    assert_eq!(min_rev, 1);
    assert_eq!(wg.len(), 3);
}

#[test]
fn test_send_applies_filters() {
    let (mut w, mut rx) = new_watcher(1, b"foo", None, 0, 4);
    w.filters = vec![filter_no_put()];

    // every event filtered out: nothing to deliver
    let wr = WatchResponse {
        watch_id: 1,
        events: vec![put_event(b"foo", 2)],
        revision: 2,
        ..Default::default()
    };
    assert!(w.send(wr).is_ok());
    assert!(rx.try_recv().is_err());

    let wr = WatchResponse {
        watch_id: 1,
        events: vec![put_event(b"foo", 3), delete_event(b"foo", 3)],
        revision: 3,
        ..Default::default()
    };
    assert!(w.send(wr).is_ok());
    assert_eq!(rx.try_recv().unwrap().events, vec![delete_event(b"foo", 3)]);

    // progress responses carry no events and still go through
    let wr = WatchResponse {
        watch_id: 1,
        revision: 4,
        ..Default::default()
    };
    assert!(w.send(wr).is_ok());
    assert_eq!(rx.try_recv().unwrap().revision, 4);
}

#[test]
fn test_send_on_full_channel_returns_response() {
    let (w, _rx) = new_watcher(1, b"foo", None, 0, 1);
    let first = WatchResponse {
        watch_id: 1,
        events: vec![put_event(b"foo", 2)],
        revision: 2,
        ..Default::default()
    };
    assert!(w.send(first).is_ok());

    let second = WatchResponse {
        watch_id: 1,
        events: vec![put_event(b"foo", 3)],
        revision: 3,
        ..Default::default()
    };
    let returned = w.send(second.clone()).unwrap_err();
    assert_eq!(returned, second);
}

#[test]
fn test_send_to_closed_channel_counts_as_delivered() {
    let (w, rx) = new_watcher(1, b"foo", None, 0, 1);
    drop(rx);

    let wr = WatchResponse {
        watch_id: 1,
        events: vec![put_event(b"foo", 2)],
        revision: 2,
        ..Default::default()
    };
    assert!(w.send(wr).is_ok());
}
