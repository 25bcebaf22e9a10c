use std::sync::Arc;

use parking_lot::RwLock;
use prost::Message;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::is_tombstone;
use super::KeyIndex;
use super::KeyValue;
use super::Lessor;
use super::Revision;
use super::StoreTxnRead;
use super::StoreTxnWrite;
use super::TreeIndex;
use super::KV;
use crate::config::StoreConfig;
use crate::constants::FINISHED_COMPACT_KEY;
use crate::constants::INITIAL_REVISION;
use crate::constants::SCHEDULED_COMPACT_KEY;
use crate::metrics::COMPACTED_KEYS_COUNTER;
use crate::Backend;
use crate::Bucket;
use crate::MvccError;
use crate::ReadTxMode;
use crate::Result;
use crate::UnsafeReader;

/// Records read per backend scan while rebuilding the index
const RESTORE_CHUNK_SIZE: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StoreRevisions {
    /// Revision of the last committed write transaction
    pub(crate) current: i64,
    /// Revision of the last compaction, -1 before any
    pub(crate) compact_main: i64,
}

/// Multi-version transactional store over a [`Backend`].
///
/// Transactions read-hold `mu` for their whole lifetime; compaction
/// write-holds it while it moves the compaction revision. Opening a
/// transaction while already holding one on the same thread may deadlock.
pub struct Store {
    pub(crate) backend: Arc<Backend>,
    pub(crate) kv_index: TreeIndex,
    pub(crate) lessor: Option<Arc<dyn Lessor>>,
    pub(crate) mu: RwLock<()>,
    pub(crate) revs: RwLock<StoreRevisions>,
    cfg: StoreConfig,
}

impl std::fmt::Debug for Store {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("revs", &*self.revs.read())
            .field("keys", &self.kv_index.len())
            .finish()
    }
}

impl Store {
    /// Opens the store and rebuilds its index from the backend
    pub fn new(
        backend: Arc<Backend>,
        lessor: Option<Arc<dyn Lessor>>,
        cfg: StoreConfig,
    ) -> Result<Self> {
        let store = Self {
            backend,
            kv_index: TreeIndex::new(),
            lessor,
            mu: RwLock::new(()),
            revs: RwLock::new(StoreRevisions {
                current: INITIAL_REVISION,
                compact_main: -1,
            }),
            cfg,
        };
        store.restore()?;
        Ok(store)
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Revision of the last committed write transaction
    pub fn rev(&self) -> i64 {
        self.revs.read().current
    }

    /// Revision of the last compaction, -1 before any
    pub fn compact_rev(&self) -> i64 {
        self.revs.read().compact_main
    }

    /// Flushes buffered writes to durable storage
    pub fn close(&self) -> Result<()> {
        self.backend.force_commit()
    }

    #[instrument(skip(self))]
    fn restore(&self) -> Result<()> {
        let (finished, scheduled) = {
            let tx = self.backend.read_tx(ReadTxMode::Concurrent);
            (
                read_meta_rev(&tx, FINISHED_COMPACT_KEY)?,
                read_meta_rev(&tx, SCHEDULED_COMPACT_KEY)?,
            )
        };

        let max_main = self.restore_index()?;

        let compact_main = finished.unwrap_or(-1);
        {
            let mut revs = self.revs.write();
            revs.compact_main = compact_main;
            revs.current = max_main.max(INITIAL_REVISION).max(compact_main);
            info!(
                "restored store: current revision {}, compact revision {}, {} keys",
                revs.current,
                revs.compact_main,
                self.kv_index.len()
            );
        }

        // resume a compaction interrupted before it finished
        if let Some(scheduled) = scheduled {
            if scheduled > compact_main {
                info!("resume scheduled compaction at {}", scheduled);
                self.revs.write().compact_main = scheduled;
                self.run_compaction(scheduled)?;
            }
        }
        Ok(())
    }

    /// Replays the key bucket in revision order. Returns the highest main
    /// revision found.
    fn restore_index(&self) -> Result<i64> {
        let tx = self.backend.read_tx(ReadTxMode::Concurrent);
        let mut start = Revision::default().to_bytes();
        let mut max_main = 0;

        loop {
            let pairs = tx.unsafe_range(Bucket::Key, &start, Some(b"".as_slice()), RESTORE_CHUNK_SIZE)?;
            for (key, value) in &pairs {
                let rev = Revision::from_bytes(key)?;
                max_main = max_main.max(rev.main);
                let kv = KeyValue::decode(value.as_slice())?;

                if is_tombstone(key) {
                    if let Some(Err(e)) = self.kv_index.update(&kv.key, |ki| ki.tombstone(rev)) {
                        warn!("tombstone at {} encountered error: {:?}", rev, e);
                    }
                    continue;
                }
                match self.kv_index.update(&kv.key, |ki| ki.put(rev)) {
                    Some(Err(e)) => warn!("restore put at {} encountered error: {:?}", rev, e),
                    Some(Ok(())) => {}
                    None => {
                        let mut ki = KeyIndex::new(kv.key.clone());
                        ki.restore(Revision::new(kv.create_revision, 0), rev, kv.version);
                        self.kv_index.insert(ki);
                    }
                }
            }

            match pairs.last() {
                Some((last, _)) if pairs.len() >= RESTORE_CHUNK_SIZE => {
                    start = last.clone();
                    start.push(0);
                }
                _ => break,
            }
        }
        Ok(max_main)
    }

    /// Discards every revision older than `rev` that is no longer visible.
    ///
    /// Must not be called while the calling thread holds a transaction.
    #[instrument(skip(self))]
    pub fn compact(
        &self,
        rev: i64,
    ) -> Result<()> {
        {
            let _mu = self.mu.write();
            {
                let mut revs = self.revs.write();
                if rev <= revs.compact_main {
                    return Err(MvccError::Compacted {
                        compact_revision: revs.compact_main,
                    }
                    .into());
                }
                if rev > revs.current {
                    return Err(MvccError::FutureRevision {
                        revision: rev,
                        current: revs.current,
                    }
                    .into());
                }
                revs.compact_main = rev;
            }

            let mut tx = self.backend.batch_tx();
            tx.unsafe_put(Bucket::Meta, SCHEDULED_COMPACT_KEY, &bincode::serialize(&rev)?);
            tx.unlock()?;
        }
        // the schedule must be durable before any record is removed
        self.backend.force_commit()?;

        self.run_compaction(rev)
    }

    fn run_compaction(
        &self,
        rev: i64,
    ) -> Result<()> {
        let keep = self.kv_index.compact(rev);
        let limit = self.cfg.compaction_batch_limit;
        let end = Revision::new(rev + 1, 0).to_bytes();
        let mut start = Revision::default().to_bytes();
        let mut removed = 0u64;

        loop {
            let mut tx = self.backend.batch_tx();
            let pairs = tx.unsafe_range(Bucket::Key, &start, Some(end.as_slice()), limit)?;
            for (key, _) in &pairs {
                if !keep.contains(&Revision::from_bytes(key)?) {
                    tx.unsafe_delete(Bucket::Key, key);
                    removed += 1;
                }
            }

            match pairs.last() {
                Some((last, _)) if pairs.len() >= limit => {
                    start = last.clone();
                    start.push(0);
                    tx.unlock()?;
                    debug!("compaction batch done, {} keys removed so far", removed);
                }
                _ => {
                    tx.unsafe_put(Bucket::Meta, FINISHED_COMPACT_KEY, &bincode::serialize(&rev)?);
                    tx.unlock()?;
                    break;
                }
            }
        }

        COMPACTED_KEYS_COUNTER.inc_by(removed);
        self.backend.force_commit()?;
        info!("finished scheduled compaction at {} ({} keys removed)", rev, removed);
        Ok(())
    }
}

fn read_meta_rev<T: UnsafeReader>(
    tx: &T,
    key: &[u8],
) -> Result<Option<i64>> {
    match tx.unsafe_range(Bucket::Meta, key, None, 0)?.into_iter().next() {
        Some((_, value)) => Ok(Some(bincode::deserialize(&value)?)),
        None => Ok(None),
    }
}

impl KV for Store {
    type ReadTxn<'a> = StoreTxnRead<'a>
    where
        Self: 'a;
    type WriteTxn<'a> = StoreTxnWrite<'a>
    where
        Self: 'a;

    fn read(
        &self,
        mode: ReadTxMode,
    ) -> StoreTxnRead<'_> {
        StoreTxnRead::new(self, mode)
    }

    fn write(&self) -> StoreTxnWrite<'_> {
        StoreTxnWrite::new(self)
    }

    fn rev(&self) -> i64 {
        Store::rev(self)
    }

    fn compact(
        &self,
        rev: i64,
    ) -> Result<()> {
        Store::compact(self, rev)
    }

    fn commit(&self) -> Result<()> {
        self.backend.force_commit()
    }
}
