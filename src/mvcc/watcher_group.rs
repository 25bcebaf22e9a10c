use std::collections::HashMap;
use std::collections::HashSet;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;
use tracing::warn;

use super::Event;
use super::FilterFn;
use super::WatchId;
use super::WatchResponse;

/// Scheduler-side identity of a watcher, unique per store
pub type WatcherHandle = u64;

/// A subscription to a key or key range, owned by the scheduler group it is in
pub(crate) struct Watcher {
    pub(crate) key: Vec<u8>,
    /// `None` watches `key` alone; an empty end watches every key `>= key`
    pub(crate) end: Option<Vec<u8>>,
    /// Lowest revision not yet delivered
    pub(crate) min_rev: i64,
    pub(crate) id: WatchId,
    pub(crate) filters: Vec<FilterFn>,
    pub(crate) tx: mpsc::Sender<WatchResponse>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("end", &self.end)
            .field("min_rev", &self.min_rev)
            .finish()
    }
}

impl Watcher {
    pub(crate) fn contains(
        &self,
        key: &[u8],
    ) -> bool {
        match &self.end {
            None => self.key == key,
            Some(end) => key >= self.key.as_slice() && (end.is_empty() || key < end.as_slice()),
        }
    }

    /// Delivers `wr` without blocking, after applying the filters.
    ///
    /// Returns the (filtered) response back when the channel is full. A
    /// response whose events were all filtered out counts as delivered, and so
    /// does one sent to a receiver that is gone.
    pub(crate) fn send(
        &self,
        mut wr: WatchResponse,
    ) -> Result<(), WatchResponse> {
        let progress_event = wr.events.is_empty();

        if !self.filters.is_empty() {
            wr.events.retain(|ev| !self.filters.iter().any(|filter| filter(ev)));
        }
        if !progress_event && wr.events.is_empty() {
            return Ok(());
        }

        match self.tx.try_send(wr) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(wr)) => Err(wr),
            Err(TrySendError::Closed(_)) => {
                debug!("watch channel of watcher {} is closed", self.id);
                Ok(())
            }
        }
    }
}

/// Events pending for one watcher
#[derive(Debug, Default)]
pub(crate) struct EventBatch {
    pub(crate) evs: Vec<Event>,
    /// Number of distinct revisions in `evs`
    pub(crate) revs: usize,
    /// First revision left out once the batch is full, 0 otherwise
    pub(crate) more_rev: i64,
}

impl EventBatch {
    pub(crate) fn add(
        &mut self,
        ev: Event,
        max_revs: usize,
    ) {
        if self.revs > max_revs {
            return;
        }

        let Some(last) = self.evs.last() else {
            self.revs = 1;
            self.evs.push(ev);
            return;
        };

        let ev_rev = ev.kv.mod_revision;
        if ev_rev > last.kv.mod_revision {
            self.revs += 1;
            if self.revs > max_revs {
                self.more_rev = ev_rev;
                return;
            }
        }
        self.evs.push(ev);
    }
}

pub(crate) type WatcherBatch = HashMap<WatcherHandle, EventBatch>;

/// Watchers indexed by the keys they observe
#[derive(Debug, Default)]
pub(crate) struct WatcherGroup {
    key_watchers: HashMap<Vec<u8>, HashSet<WatcherHandle>>,
    range_watchers: HashSet<WatcherHandle>,
    watchers: HashMap<WatcherHandle, Watcher>,
}

impl WatcherGroup {
    pub(crate) fn add(
        &mut self,
        handle: WatcherHandle,
        w: Watcher,
    ) {
        if w.end.is_some() {
            self.range_watchers.insert(handle);
        } else {
            self.key_watchers.entry(w.key.clone()).or_default().insert(handle);
        }
        self.watchers.insert(handle, w);
    }

    pub(crate) fn remove(
        &mut self,
        handle: WatcherHandle,
    ) -> Option<Watcher> {
        let w = self.watchers.remove(&handle)?;
        if w.end.is_some() {
            self.range_watchers.remove(&handle);
        } else if let Some(set) = self.key_watchers.get_mut(&w.key) {
            set.remove(&handle);
            if set.is_empty() {
                self.key_watchers.remove(&w.key);
            }
        }
        Some(w)
    }

    pub(crate) fn get(
        &self,
        handle: WatcherHandle,
    ) -> Option<&Watcher> {
        self.watchers.get(&handle)
    }

    pub(crate) fn contains(
        &self,
        handle: WatcherHandle,
    ) -> bool {
        self.watchers.contains_key(&handle)
    }

    pub(crate) fn len(&self) -> usize {
        self.watchers.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    /// Whether any watcher in the group observes `key`
    pub(crate) fn contains_key(
        &self,
        key: &[u8],
    ) -> bool {
        self.key_watchers.contains_key(key)
            || self
                .range_watchers
                .iter()
                .any(|h| self.watchers.get(h).is_some_and(|w| w.contains(key)))
    }

    /// Handles of the watchers observing `key`
    pub(crate) fn watcher_set_by_key(
        &self,
        key: &[u8],
    ) -> Vec<WatcherHandle> {
        let mut handles: Vec<WatcherHandle> = self
            .key_watchers
            .get(key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        handles.extend(
            self.range_watchers
                .iter()
                .filter(|h| self.watchers.get(*h).is_some_and(|w| w.contains(key))),
        );
        handles
    }

    /// Groups `evs` per watcher, skipping events below each watcher's
    /// `min_rev`.
    pub(crate) fn new_watcher_batch(
        &self,
        evs: &[Event],
        max_revs: usize,
    ) -> WatcherBatch {
        let mut wb = WatcherBatch::new();
        if self.watchers.is_empty() {
            return wb;
        }
        for ev in evs {
            for handle in self.watcher_set_by_key(&ev.kv.key) {
                let Some(w) = self.watchers.get(&handle) else {
                    continue;
                };
                if ev.kv.mod_revision >= w.min_rev {
                    wb.entry(handle).or_default().add(ev.clone(), max_revs);
                }
            }
        }
        wb
    }

    /// Moves up to `max_watchers` watchers into a new group and returns it
    /// with the lowest `min_rev` among them.
    ///
    /// Watchers behind `compact_rev` get a terminal compaction response and
    /// are dropped; the handles of those are returned as well. A watcher whose
    /// compaction response does not fit its channel stays for the next pass.
    pub(crate) fn choose(
        &mut self,
        max_watchers: usize,
        cur_rev: i64,
        compact_rev: i64,
    ) -> (WatcherGroup, i64, Vec<WatcherHandle>) {
        let handles: Vec<WatcherHandle> = self.watchers.keys().take(max_watchers).copied().collect();

        let mut chosen = WatcherGroup::default();
        let mut compacted = Vec::new();
        let mut min_rev = i64::MAX;

        for handle in handles {
            let Some(w) = self.watchers.get(&handle) else {
                continue;
            };
            if w.min_rev > cur_rev {
                warn!(
                    "unsynced watcher {} is ahead of the store: min_rev {} > current {}",
                    w.id, w.min_rev, cur_rev
                );
            }

            if w.min_rev < compact_rev {
                let wr = WatchResponse {
                    watch_id: w.id,
                    compact_revision: compact_rev,
                    ..Default::default()
                };
                if w.send(wr).is_ok() {
                    self.remove(handle);
                    compacted.push(handle);
                }
                continue;
            }

            if let Some(w) = self.remove(handle) {
                min_rev = min_rev.min(w.min_rev);
                chosen.add(handle, w);
            }
        }
        (chosen, min_rev, compacted)
    }

    /// Removes and returns every watcher
    pub(crate) fn drain(&mut self) -> Vec<(WatcherHandle, Watcher)> {
        self.key_watchers.clear();
        self.range_watchers.clear();
        self.watchers.drain().collect()
    }
}
