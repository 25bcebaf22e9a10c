//! Store decorator that streams committed changes to watchers.
//!
//! Every watcher is in exactly one of three places:
//! - `synced`: caught up, fed directly by committing write transactions;
//! - `unsynced`: behind, caught up from history by the sync loop;
//! - a victim batch: its channel was full, the victim loop retries delivery.
//!
//! Victim batches are taken out of the group lock while they are retried; the
//! handles of those watchers sit in `in_flight` until they are placed again.
//! The `canceled` notice of a watcher whose channel was full is retried by the
//! victim loop as well.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Condvar;
use parking_lot::Mutex;
use prost::Message;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;

use super::is_tombstone;
use super::Event;
use super::EventBatch;
use super::EventType;
use super::FilterFn;
use super::KeyValue;
use super::Lessor;
use super::RangeOptions;
use super::RangeResult;
use super::ReadView;
use super::Revision;
use super::Store;
use super::StoreTxnRead;
use super::StoreTxnWrite;
use super::TxnRead;
use super::TxnWrite;
use super::WatchId;
use super::WatchResponse;
use super::WatchStream;
use super::Watcher;
use super::WatcherGroup;
use super::WatcherHandle;
use super::WriteView;
use super::KV;
use crate::metrics::PENDING_EVENTS_COUNTER;
use crate::metrics::SLOW_WATCHER_GAUGE;
use crate::metrics::WATCHER_GAUGE;
use crate::metrics::WATCH_STREAM_GAUGE;
use crate::spawn_commit_loop;
use crate::Backend;
use crate::Bucket;
use crate::KvPairs;
use crate::LeaseId;
use crate::MvccConfig;
use crate::ReadTxMode;
use crate::Result;
use crate::UnsafeReader;
use crate::WatchConfig;

/// Removes a watcher from the store. Blocks while the watcher is being
/// retried by the victim loop.
pub type CancelFn = Box<dyn FnOnce() + Send + Sync>;

type VictimBatch = HashMap<WatcherHandle, (Watcher, EventBatch)>;

#[derive(Default)]
struct WatcherGroups {
    synced: WatcherGroup,
    unsynced: WatcherGroup,
    victims: Vec<VictimBatch>,
    in_flight: HashSet<WatcherHandle>,
    /// Terminal responses of canceled watchers waiting for channel space
    notices: Vec<(mpsc::Sender<WatchResponse>, WatchResponse)>,
}

impl WatcherGroups {
    fn has_victims(&self) -> bool {
        !self.victims.is_empty() || !self.notices.is_empty()
    }
}

pub(crate) struct WatchableInner {
    pub(crate) store: Store,
    groups: Mutex<WatcherGroups>,
    /// Signaled whenever handles leave `in_flight`
    in_flight_done: Condvar,
    victim_notify: Notify,
    next_handle: AtomicU64,
    pub(crate) cfg: WatchConfig,
}

/// Converts backend records to events of keys watched by `wg`
fn kvs_to_events(
    wg: &WatcherGroup,
    pairs: KvPairs,
) -> Vec<Event> {
    let mut evs = Vec::new();
    for (rev_bytes, value) in pairs {
        let mut kv = match KeyValue::decode(value.as_slice()) {
            Ok(kv) => kv,
            Err(e) => {
                error!("failed to decode key-value record: {:?}", e);
                continue;
            }
        };
        if !wg.contains_key(&kv.key) {
            continue;
        }

        let event_type = if is_tombstone(&rev_bytes) {
            // tombstone records carry no revision of their own
            match Revision::from_bytes(&rev_bytes) {
                Ok(rev) => kv.mod_revision = rev.main,
                Err(e) => {
                    error!("failed to decode tombstone revision: {:?}", e);
                    continue;
                }
            }
            EventType::Delete
        } else {
            EventType::Put
        };
        evs.push(Event { event_type, kv });
    }
    evs
}

impl WatchableInner {
    pub(crate) fn watch(
        self: &Arc<Self>,
        key: Vec<u8>,
        end: Option<Vec<u8>>,
        start_rev: i64,
        id: WatchId,
        tx: mpsc::Sender<WatchResponse>,
        filters: Vec<FilterFn>,
    ) -> (WatcherHandle, CancelFn) {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let mut w = Watcher {
            key,
            end,
            min_rev: start_rev,
            id,
            filters,
            tx,
        };

        {
            let mut groups = self.groups.lock();
            let cur_rev = self.store.rev();
            if start_rev == 0 || start_rev > cur_rev {
                w.min_rev = (cur_rev + 1).max(start_rev);
                groups.synced.add(handle, w);
            } else {
                SLOW_WATCHER_GAUGE.inc();
                groups.unsynced.add(handle, w);
            }
            WATCHER_GAUGE.inc();
        }
        trace!("watcher {} registered with handle {}", id, handle);

        let inner = Arc::clone(self);
        (handle, Box::new(move || inner.cancel_watcher(handle)))
    }

    fn cancel_watcher(
        &self,
        handle: WatcherHandle,
    ) {
        let mut groups = self.groups.lock();
        loop {
            if groups.unsynced.remove(handle).is_some() {
                SLOW_WATCHER_GAUGE.dec();
                WATCHER_GAUGE.dec();
                return;
            }
            if groups.synced.remove(handle).is_some() {
                WATCHER_GAUGE.dec();
                return;
            }
            if groups.victims.iter_mut().any(|b| b.remove(&handle).is_some()) {
                SLOW_WATCHER_GAUGE.dec();
                WATCHER_GAUGE.dec();
                return;
            }
            // compacted or already canceled
            if !groups.in_flight.contains(&handle) {
                return;
            }
            // owned by a victim retry in progress
            self.in_flight_done.wait(&mut groups);
        }
    }

    /// Delivers the terminal response of a canceled watcher. A full channel
    /// hands it to the victim loop.
    pub(crate) fn send_canceled(
        &self,
        tx: mpsc::Sender<WatchResponse>,
        wr: WatchResponse,
    ) {
        match tx.try_send(wr) {
            Ok(()) => {}
            Err(TrySendError::Full(wr)) => {
                debug!("canceled notice for watch {} deferred", wr.watch_id);
                self.groups.lock().notices.push((tx, wr));
                self.victim_notify.notify_one();
            }
            Err(TrySendError::Closed(wr)) => {
                trace!("canceled notice for watch {} has no receiver", wr.watch_id);
            }
        }
    }

    /// Sends a progress response to `handle` if it is synced
    pub(crate) fn progress(
        &self,
        handle: WatcherHandle,
    ) {
        let groups = self.groups.lock();
        if let Some(w) = groups.synced.get(handle) {
            let wr = WatchResponse {
                watch_id: w.id,
                revision: self.store.rev(),
                ..Default::default()
            };
            // a full channel means events are flowing already
            let _ = w.send(wr);
        }
    }

    fn add_victim(
        &self,
        groups: &mut WatcherGroups,
        victim: VictimBatch,
    ) {
        if victim.is_empty() {
            return;
        }
        groups.victims.push(victim);
        self.victim_notify.notify_one();
    }

    /// Delivers the events of the transaction committing at `rev` to the
    /// synced watchers.
    fn notify(
        &self,
        groups: &mut WatcherGroups,
        rev: i64,
        evs: &[Event],
    ) {
        let batch = groups
            .synced
            .new_watcher_batch(evs, self.cfg.watch_batch_max_revs);
        let mut victim = VictimBatch::new();

        for (handle, eb) in batch {
            debug_assert_eq!(eb.revs, 1, "notification spans multiple revisions");
            let Some(w) = groups.synced.get(handle) else {
                continue;
            };

            let n = eb.evs.len() as u64;
            let wr = WatchResponse {
                watch_id: w.id,
                events: eb.evs,
                revision: rev,
                ..Default::default()
            };
            match w.send(wr) {
                Ok(()) => PENDING_EVENTS_COUNTER.inc_by(n),
                Err(wr) => {
                    if let Some(mut w) = groups.synced.remove(handle) {
                        w.min_rev = rev + 1;
                        SLOW_WATCHER_GAUGE.inc();
                        let eb = EventBatch {
                            evs: wr.events,
                            revs: eb.revs,
                            more_rev: eb.more_rev,
                        };
                        victim.insert(handle, (w, eb));
                    }
                }
            }
        }
        self.add_victim(groups, victim);
    }

    /// Catches up a bounded set of unsynced watchers with one backend scan.
    /// Returns the number of watchers still unsynced.
    fn sync_watchers(&self) -> usize {
        let mut groups = self.groups.lock();
        if groups.unsynced.is_empty() {
            return 0;
        }

        let revs = self.store.revs.read();
        let (cur_rev, compact_rev) = (revs.current, revs.compact_main);

        let (mut wg, min_rev, compacted) =
            groups
                .unsynced
                .choose(self.cfg.max_watchers_per_sync, cur_rev, compact_rev);
        for handle in compacted {
            debug!("watcher handle {} removed after compaction at {}", handle, compact_rev);
            SLOW_WATCHER_GAUGE.dec();
            WATCHER_GAUGE.dec();
        }
        if wg.is_empty() {
            return groups.unsynced.len();
        }

        let min_bytes = Revision::new(min_rev, 0).to_bytes();
        let max_bytes = Revision::new(cur_rev + 1, 0).to_bytes();
        let pairs = {
            let tx = self.store.backend.read_tx(ReadTxMode::Shared);
            tx.unsafe_range(Bucket::Key, &min_bytes, Some(max_bytes.as_slice()), 0)
        };
        drop(revs);

        let pairs = match pairs {
            Ok(pairs) => pairs,
            Err(e) => {
                error!("failed to read history for unsynced watchers: {:?}", e);
                for (handle, w) in wg.drain() {
                    groups.unsynced.add(handle, w);
                }
                return groups.unsynced.len();
            }
        };

        let evs = kvs_to_events(&wg, pairs);
        let mut wb = wg.new_watcher_batch(&evs, self.cfg.watch_batch_max_revs);
        let mut victims = VictimBatch::new();

        for (handle, mut w) in wg.drain() {
            w.min_rev = cur_rev + 1;

            let Some(eb) = wb.remove(&handle) else {
                // nothing to deliver
                SLOW_WATCHER_GAUGE.dec();
                groups.synced.add(handle, w);
                continue;
            };
            if eb.more_rev != 0 {
                w.min_rev = eb.more_rev;
            }

            let n = eb.evs.len() as u64;
            let wr = WatchResponse {
                watch_id: w.id,
                events: eb.evs,
                revision: cur_rev,
                ..Default::default()
            };
            match w.send(wr) {
                Ok(()) => {
                    PENDING_EVENTS_COUNTER.inc_by(n);
                    if eb.more_rev != 0 {
                        // more history to read
                        groups.unsynced.add(handle, w);
                    } else {
                        SLOW_WATCHER_GAUGE.dec();
                        groups.synced.add(handle, w);
                    }
                }
                Err(wr) => {
                    let eb = EventBatch {
                        evs: wr.events,
                        revs: eb.revs,
                        more_rev: eb.more_rev,
                    };
                    victims.insert(handle, (w, eb));
                }
            }
        }
        self.add_victim(&mut groups, victims);

        groups.unsynced.len()
    }

    /// Retries delivery to the victims and the deferred canceled notices.
    /// Returns how many were delivered.
    fn move_victims(&self) -> usize {
        let (victims, notices) = {
            let mut groups = self.groups.lock();
            let victims = std::mem::take(&mut groups.victims);
            for batch in &victims {
                groups.in_flight.extend(batch.keys().copied());
            }
            (victims, std::mem::take(&mut groups.notices))
        };

        let mut moved = 0;
        let mut pending_notices = Vec::new();
        for (tx, wr) in notices {
            match tx.try_send(wr) {
                Ok(()) => moved += 1,
                Err(TrySendError::Full(wr)) => pending_notices.push((tx, wr)),
                // the stream is gone
                Err(TrySendError::Closed(_)) => {}
            }
        }
        if !pending_notices.is_empty() {
            self.groups.lock().notices.extend(pending_notices);
        }

        let mut new_victim = VictimBatch::new();
        for batch in victims {
            let mut delivered = Vec::new();
            for (handle, (w, eb)) in batch {
                // the watcher has observed the store up to, but not including, min_rev
                let rev = w.min_rev - 1;
                let n = eb.evs.len() as u64;
                let wr = WatchResponse {
                    watch_id: w.id,
                    events: eb.evs,
                    revision: rev,
                    ..Default::default()
                };
                match w.send(wr) {
                    Ok(()) => {
                        PENDING_EVENTS_COUNTER.inc_by(n);
                        moved += 1;
                        delivered.push((handle, w, eb.more_rev));
                    }
                    Err(wr) => {
                        let eb = EventBatch {
                            evs: wr.events,
                            revs: eb.revs,
                            more_rev: eb.more_rev,
                        };
                        new_victim.insert(handle, (w, eb));
                    }
                }
            }

            let mut groups = self.groups.lock();
            let cur_rev = self.store.rev();
            for (handle, mut w, more_rev) in delivered {
                groups.in_flight.remove(&handle);
                if more_rev != 0 {
                    w.min_rev = more_rev;
                }
                if w.min_rev <= cur_rev {
                    groups.unsynced.add(handle, w);
                } else {
                    SLOW_WATCHER_GAUGE.dec();
                    groups.synced.add(handle, w);
                }
            }
            self.in_flight_done.notify_all();
        }

        if !new_victim.is_empty() {
            let mut groups = self.groups.lock();
            for handle in new_victim.keys() {
                groups.in_flight.remove(handle);
            }
            groups.victims.push(new_victim);
            self.in_flight_done.notify_all();
        }
        moved
    }

    fn counts(&self) -> (usize, usize, usize) {
        let groups = self.groups.lock();
        let victims = groups.victims.iter().map(|b| b.len()).sum::<usize>() + groups.in_flight.len();
        (groups.synced.len(), groups.unsynced.len(), victims)
    }
}

async fn sync_watchers_loop(
    inner: Arc<WatchableInner>,
    mut shutdown_signal: watch::Receiver<()>,
) {
    let wait = inner.cfg.sync_interval();
    loop {
        let st = Instant::now();
        let last_unsynced = inner.groups.lock().unsynced.len();
        let mut unsynced = 0;
        if last_unsynced > 0 {
            unsynced = inner.sync_watchers();
        }
        let sync_duration = st.elapsed();

        // yield the time the pass took when it made progress but work remains
        let delay = if unsynced != 0 && last_unsynced > unsynced {
            sync_duration
        } else {
            wait
        };

        tokio::select! {
            _ = shutdown_signal.changed() => {
                debug!("[SyncWatchersLoop] shutdown signal received.");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn sync_victims_loop(
    inner: Arc<WatchableInner>,
    mut shutdown_signal: watch::Receiver<()>,
) {
    let retry = inner.cfg.victim_retry_interval();
    loop {
        while inner.move_victims() != 0 {
            tokio::task::yield_now().await;
        }
        let is_empty = !inner.groups.lock().has_victims();

        if is_empty {
            tokio::select! {
                _ = shutdown_signal.changed() => {
                    debug!("[SyncVictimsLoop] shutdown signal received.");
                    return;
                }
                _ = inner.victim_notify.notified() => {}
            }
        } else {
            tokio::select! {
                _ = shutdown_signal.changed() => {
                    debug!("[SyncVictimsLoop] shutdown signal received.");
                    return;
                }
                _ = tokio::time::sleep(retry) => {}
                _ = inner.victim_notify.notified() => {}
            }
        }
    }
}

/// A [`Store`] whose committed changes are streamed to watchers.
///
/// Must be created inside a tokio runtime: the sync, victim and commit loops
/// run as background tasks until [`WatchableStore::close`].
pub struct WatchableStore {
    inner: Arc<WatchableInner>,
    shutdown_tx: watch::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WatchableStore {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let (synced, unsynced, victims) = self.inner.counts();
        f.debug_struct("WatchableStore")
            .field("store", &self.inner.store)
            .field("synced", &synced)
            .field("unsynced", &unsynced)
            .field("victims", &victims)
            .finish()
    }
}

impl WatchableStore {
    pub fn new(
        backend: Arc<Backend>,
        lessor: Option<Arc<dyn Lessor>>,
        config: &MvccConfig,
    ) -> Result<Self> {
        let store = Store::new(backend.clone(), lessor, config.store.clone())?;
        let inner = Arc::new(WatchableInner {
            store,
            groups: Mutex::new(WatcherGroups::default()),
            in_flight_done: Condvar::new(),
            victim_notify: Notify::new(),
            next_handle: AtomicU64::new(0),
            cfg: config.watch.clone(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let mut tasks = vec![
            tokio::spawn(sync_watchers_loop(inner.clone(), shutdown_rx.clone())),
            tokio::spawn(sync_victims_loop(inner.clone(), shutdown_rx.clone())),
        ];
        if let Some(interval) = config.backend.batch_interval() {
            tasks.push(spawn_commit_loop(backend, interval, shutdown_rx));
        }
        info!("watchable store started at revision {}", inner.store.rev());

        Ok(Self {
            inner,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    /// Opens a sled-backed store as configured
    pub fn open(
        config: &MvccConfig,
        lessor: Option<Arc<dyn Lessor>>,
    ) -> Result<Self> {
        let backend = Arc::new(Backend::open(&config.backend)?);
        Self::new(backend, lessor, config)
    }

    /// Revision of the last compaction, -1 before any
    pub fn compact_rev(&self) -> i64 {
        self.inner.store.compact_rev()
    }

    pub fn new_watch_stream(&self) -> WatchStream {
        WATCH_STREAM_GAUGE.inc();
        WatchStream::new(self.inner.clone(), self.inner.cfg.chan_buf_len)
    }

    /// Registers a watcher on `[key, end)` delivering into `tx`.
    ///
    /// `start_rev == 0` or a future `start_rev` watches new changes only;
    /// otherwise history from `start_rev` is replayed first.
    pub fn watch(
        &self,
        key: &[u8],
        end: Option<&[u8]>,
        start_rev: i64,
        id: WatchId,
        tx: mpsc::Sender<WatchResponse>,
        filters: Vec<FilterFn>,
    ) -> (WatcherHandle, CancelFn) {
        self.inner
            .watch(key.to_vec(), end.map(<[u8]>::to_vec), start_rev, id, tx, filters)
    }

    /// Number of (synced, unsynced, victim) watchers
    pub fn watcher_counts(&self) -> (usize, usize, usize) {
        self.inner.counts()
    }

    /// Stops the background tasks and flushes the backend
    pub async fn close(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.await?;
        }
        self.inner.store.close()
    }
}

impl Drop for WatchableStore {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Write transaction that notifies synced watchers when it ends
pub struct WatchableTxnWrite<'a> {
    inner: &'a WatchableInner,
    txn: StoreTxnWrite<'a>,
    ended: bool,
}

impl WatchableTxnWrite<'_> {
    fn finish(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;

        let changes = self.txn.changes();
        if changes.is_empty() {
            return self.txn.finish();
        }

        let rev = self.txn.commit_rev();
        let evs: Vec<Event> = changes
            .iter()
            .cloned()
            .map(|mut kv| {
                if kv.create_revision == 0 {
                    // tombstone records carry only the key
                    kv.mod_revision = rev;
                    Event {
                        event_type: EventType::Delete,
                        kv,
                    }
                } else {
                    Event {
                        event_type: EventType::Put,
                        kv,
                    }
                }
            })
            .collect();

        let mut groups = self.inner.groups.lock();
        self.inner.notify(&mut groups, rev, &evs);
        self.txn.publish();
        drop(groups);

        // a batch-limit commit to the engine runs without the group lock
        self.txn.finish()
    }
}

impl ReadView for WatchableTxnWrite<'_> {
    fn first_rev(&self) -> i64 {
        self.txn.first_rev()
    }

    fn rev(&self) -> i64 {
        self.txn.rev()
    }

    fn range(
        &self,
        key: &[u8],
        end: Option<&[u8]>,
        opts: RangeOptions,
    ) -> Result<RangeResult> {
        self.txn.range(key, end, opts)
    }
}

impl WriteView for WatchableTxnWrite<'_> {
    fn delete_range(
        &mut self,
        key: &[u8],
        end: Option<&[u8]>,
    ) -> Result<(i64, i64)> {
        self.txn.delete_range(key, end)
    }

    fn put(
        &mut self,
        key: &[u8],
        value: &[u8],
        lease: LeaseId,
    ) -> Result<i64> {
        self.txn.put(key, value, lease)
    }
}

impl TxnRead for WatchableTxnWrite<'_> {
    fn end(mut self) -> Result<()> {
        self.finish()
    }
}

impl TxnWrite for WatchableTxnWrite<'_> {
    fn changes(&self) -> &[KeyValue] {
        self.txn.changes()
    }
}

impl Drop for WatchableTxnWrite<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            error!("write transaction failed to end on drop: {:?}", e);
        }
    }
}

impl KV for WatchableStore {
    type ReadTxn<'a> = StoreTxnRead<'a>
    where
        Self: 'a;
    type WriteTxn<'a> = WatchableTxnWrite<'a>
    where
        Self: 'a;

    fn read(
        &self,
        mode: ReadTxMode,
    ) -> StoreTxnRead<'_> {
        StoreTxnRead::new(&self.inner.store, mode)
    }

    fn write(&self) -> WatchableTxnWrite<'_> {
        WatchableTxnWrite {
            inner: &self.inner,
            txn: StoreTxnWrite::new(&self.inner.store),
            ended: false,
        }
    }

    fn rev(&self) -> i64 {
        self.inner.store.rev()
    }

    fn compact(
        &self,
        rev: i64,
    ) -> Result<()> {
        self.inner.store.compact(rev)
    }

    fn commit(&self) -> Result<()> {
        self.inner.store.backend.force_commit()
    }
}
