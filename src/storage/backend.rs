use std::collections::BTreeMap;
use std::collections::HashMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parking_lot::MutexGuard;
use parking_lot::RwLock;
use parking_lot::RwLockReadGuard;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

use super::init_sled_storage_engine_db;
use super::Bucket;
use super::SledStorageEngine;
use super::StorageEngine;
use super::WriteOp;
use crate::config::BackendConfig;
use crate::metrics::BACKEND_COMMIT_COUNTER;
use crate::Result;

pub type KvPairs = Vec<(Vec<u8>, Vec<u8>)>;

/// How a read transaction observes the backend read buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTxMode {
    /// Copies a snapshot of the buffer. Safe for long reads.
    Concurrent,
    /// Borrows the live buffer; blocks writers' write-back while held.
    ///
    /// A writer blocked this way holds the watch group lock, so the holder
    /// must not register or cancel watchers until the read ends.
    Shared,
}

/// Bucketed records not yet applied to the engine. `None` marks a deletion.
#[derive(Debug, Default, Clone)]
pub struct TxBuffer {
    buckets: HashMap<Bucket, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
}

fn scan_bounds<'a>(
    start: &'a [u8],
    end: &'a [u8],
) -> Option<(Bound<&'a [u8]>, Bound<&'a [u8]>)> {
    if end.is_empty() {
        return Some((Bound::Included(start), Bound::Unbounded));
    }
    (start < end).then_some((Bound::Included(start), Bound::Excluded(end)))
}

impl TxBuffer {
    fn put(
        &mut self,
        bucket: Bucket,
        key: &[u8],
        value: &[u8],
    ) {
        self.buckets
            .entry(bucket)
            .or_default()
            .insert(key.to_vec(), Some(value.to_vec()));
    }

    fn delete(
        &mut self,
        bucket: Bucket,
        key: &[u8],
    ) {
        self.buckets.entry(bucket).or_default().insert(key.to_vec(), None);
    }

    fn merge(
        &mut self,
        other: TxBuffer,
    ) {
        for (bucket, entries) in other.buckets {
            self.buckets.entry(bucket).or_default().extend(entries);
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(
        &self,
        bucket: Bucket,
        key: &[u8],
    ) -> Option<Option<&Vec<u8>>> {
        self.buckets
            .get(&bucket)
            .and_then(|b| b.get(key))
            .map(|v| v.as_ref())
    }

    fn scan<'a>(
        &'a self,
        bucket: Bucket,
        start: &'a [u8],
        end: &'a [u8],
    ) -> impl Iterator<Item = (&'a Vec<u8>, &'a Option<Vec<u8>>)> + 'a {
        self.buckets
            .get(&bucket)
            .zip(scan_bounds(start, end))
            .into_iter()
            .flat_map(|(entries, bounds)| entries.range::<[u8], _>(bounds))
    }

    fn to_ops(&self) -> Vec<(Bucket, Vec<WriteOp>)> {
        self.buckets
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(bucket, entries)| {
                let ops = entries
                    .iter()
                    .map(|(key, value)| match value {
                        Some(value) => WriteOp::Put {
                            key: key.clone(),
                            value: value.clone(),
                        },
                        None => WriteOp::Delete { key: key.clone() },
                    })
                    .collect();
                (*bucket, ops)
            })
            .collect()
    }
}

/// Reads `bucket` through the engine with `layers` applied on top, oldest first.
///
/// `end == None` looks up `key` alone, an empty `end` scans to the last key.
fn read_layers(
    engine: &dyn StorageEngine,
    layers: &[&TxBuffer],
    bucket: Bucket,
    key: &[u8],
    end: Option<&[u8]>,
    limit: usize,
) -> Result<KvPairs> {
    let Some(end) = end else {
        for layer in layers.iter().rev() {
            if let Some(value) = layer.lookup(bucket, key) {
                return Ok(value
                    .map(|v| vec![(key.to_vec(), v.clone())])
                    .unwrap_or_default());
            }
        }
        return Ok(engine
            .get(bucket, key)?
            .map(|v| vec![(key.to_vec(), v)])
            .unwrap_or_default());
    };

    let buffered = layers.iter().any(|l| l.scan(bucket, key, end).next().is_some());
    if !buffered {
        return engine.range(bucket, key, end, limit);
    }

    let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
        engine.range(bucket, key, end, 0)?.into_iter().collect();
    for layer in layers {
        for (k, v) in layer.scan(bucket, key, end) {
            match v {
                Some(v) => {
                    merged.insert(k.clone(), v.clone());
                }
                None => {
                    merged.remove(k);
                }
            }
        }
    }

    let iter = merged.into_iter();
    Ok(if limit > 0 {
        iter.take(limit).collect()
    } else {
        iter.collect()
    })
}

/// Batched, buffered access to a [`StorageEngine`].
///
/// At most one [`BatchTx`] is open at a time. Its writes become visible to
/// readers when it is unlocked (written back into the read buffer) and reach
/// the engine on the next commit.
pub struct Backend {
    engine: Arc<dyn StorageEngine>,
    batch_tx: Mutex<TxBuffer>,
    read_buffer: RwLock<Arc<TxBuffer>>,
    batch_limit: usize,
}

impl std::fmt::Debug for Backend {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("buffered", &self.buffered_len())
            .field("batch_limit", &self.batch_limit)
            .finish()
    }
}

impl Backend {
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        batch_limit: usize,
    ) -> Result<Self> {
        for bucket in Bucket::ALL {
            engine.create_bucket(bucket)?;
        }
        Ok(Self {
            engine,
            batch_tx: Mutex::new(TxBuffer::default()),
            read_buffer: RwLock::new(Arc::new(TxBuffer::default())),
            batch_limit,
        })
    }

    /// Opens a sled-backed backend under `config.data_dir`
    pub fn open(config: &BackendConfig) -> Result<Self> {
        let db = init_sled_storage_engine_db(config)?;
        Self::new(Arc::new(SledStorageEngine::new(db)), config.batch_limit)
    }

    /// Acquires the single writer slot
    pub fn batch_tx(&self) -> BatchTx<'_> {
        BatchTx {
            backend: self,
            staged: self.batch_tx.lock(),
            released: false,
        }
    }

    pub fn read_tx(
        &self,
        mode: ReadTxMode,
    ) -> ReadTx<'_> {
        let buffer = match mode {
            ReadTxMode::Shared => ReadBuffer::Shared(self.read_buffer.read()),
            ReadTxMode::Concurrent => ReadBuffer::Concurrent(self.read_buffer.read().clone()),
        };
        ReadTx {
            engine: self.engine.as_ref(),
            buffer,
        }
    }

    /// Applies the read buffer to the engine
    pub fn commit(&self) -> Result<()> {
        let _slot = self.batch_tx.lock();
        self.commit_locked(false)
    }

    /// Applies the read buffer to the engine and flushes it to disk
    pub fn force_commit(&self) -> Result<()> {
        let _slot = self.batch_tx.lock();
        self.commit_locked(true)
    }

    /// Number of written-back records waiting for a commit
    pub fn buffered_len(&self) -> usize {
        self.read_buffer.read().len()
    }

    /// Caller must hold the writer slot.
    #[instrument(skip(self))]
    fn commit_locked(
        &self,
        force: bool,
    ) -> Result<()> {
        let snapshot = self.read_buffer.read().clone();
        if !snapshot.is_empty() {
            for (bucket, ops) in snapshot.to_ops() {
                trace!("commit {} ops into bucket {}", ops.len(), bucket.name());
                self.engine.apply_batch(bucket, ops)?;
            }
        }
        if force {
            self.engine.flush()?;
        }
        if !snapshot.is_empty() {
            *self.read_buffer.write() = Arc::new(TxBuffer::default());
            BACKEND_COMMIT_COUNTER.inc();
            debug!("committed {} buffered records", snapshot.len());
        }
        Ok(())
    }
}

/// Exclusive write transaction over the backend
pub struct BatchTx<'a> {
    backend: &'a Backend,
    staged: MutexGuard<'a, TxBuffer>,
    released: bool,
}

impl BatchTx<'_> {
    pub fn unsafe_put(
        &mut self,
        bucket: Bucket,
        key: &[u8],
        value: &[u8],
    ) {
        self.staged.put(bucket, key, value);
    }

    /// Like [`BatchTx::unsafe_put`], for keys written in ascending order
    pub fn unsafe_seq_put(
        &mut self,
        bucket: Bucket,
        key: &[u8],
        value: &[u8],
    ) {
        self.staged.put(bucket, key, value);
    }

    pub fn unsafe_delete(
        &mut self,
        bucket: Bucket,
        key: &[u8],
    ) {
        self.staged.delete(bucket, key);
    }

    /// Writes staged records back into the read buffer, keeping the slot.
    pub fn write_back(&mut self) {
        self.merge_staged();
    }

    /// Writes staged records back into the read buffer and releases the slot.
    ///
    /// Commits to the engine once `batch_limit` records are buffered. A failed
    /// commit keeps the records buffered and readable.
    pub fn unlock(mut self) -> Result<()> {
        self.released = true;
        self.release()
    }

    /// Returns the number of buffered records
    fn merge_staged(&mut self) -> usize {
        let staged = std::mem::take(&mut *self.staged);
        if staged.is_empty() {
            return self.backend.buffered_len();
        }
        let mut guard = self.backend.read_buffer.write();
        let buffer = Arc::make_mut(&mut *guard);
        buffer.merge(staged);
        buffer.len()
    }

    fn release(&mut self) -> Result<()> {
        if self.merge_staged() >= self.backend.batch_limit {
            self.backend.commit_locked(false)?;
        }
        Ok(())
    }
}

impl Drop for BatchTx<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.release() {
                error!("batch tx write back failed on drop: {:?}", e);
            }
        }
    }
}

enum ReadBuffer<'a> {
    Shared(RwLockReadGuard<'a, Arc<TxBuffer>>),
    Concurrent(Arc<TxBuffer>),
}

/// Read transaction over committed and written-back records
pub struct ReadTx<'a> {
    engine: &'a dyn StorageEngine,
    buffer: ReadBuffer<'a>,
}

impl ReadTx<'_> {
    pub fn mode(&self) -> ReadTxMode {
        match self.buffer {
            ReadBuffer::Shared(_) => ReadTxMode::Shared,
            ReadBuffer::Concurrent(_) => ReadTxMode::Concurrent,
        }
    }

    fn buffer(&self) -> &TxBuffer {
        match &self.buffer {
            ReadBuffer::Shared(guard) => &***guard,
            ReadBuffer::Concurrent(snapshot) => &**snapshot,
        }
    }
}

/// Raw range reads shared by read and batch transactions.
///
/// `end == None` looks up `key` alone, an empty `end` scans to the last key,
/// otherwise `[key, end)` is scanned. `limit == 0` means no limit.
pub trait UnsafeReader {
    fn unsafe_range(
        &self,
        bucket: Bucket,
        key: &[u8],
        end: Option<&[u8]>,
        limit: usize,
    ) -> Result<KvPairs>;
}

impl UnsafeReader for ReadTx<'_> {
    fn unsafe_range(
        &self,
        bucket: Bucket,
        key: &[u8],
        end: Option<&[u8]>,
        limit: usize,
    ) -> Result<KvPairs> {
        read_layers(self.engine, &[self.buffer()], bucket, key, end, limit)
    }
}

impl UnsafeReader for BatchTx<'_> {
    /// Reads committed, written-back and this transaction's own records
    fn unsafe_range(
        &self,
        bucket: Bucket,
        key: &[u8],
        end: Option<&[u8]>,
        limit: usize,
    ) -> Result<KvPairs> {
        let buffer = self.backend.read_buffer.read().clone();
        read_layers(
            self.backend.engine.as_ref(),
            &[buffer.as_ref(), &*self.staged],
            bucket,
            key,
            end,
            limit,
        )
    }
}

/// Periodically commits the read buffer until `shutdown_signal` fires
pub fn spawn_commit_loop(
    backend: Arc<Backend>,
    interval: Duration,
    mut shutdown_signal: watch::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown_signal.changed() => {
                    debug!("[CommitLoop] shutdown signal received.");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = backend.commit() {
                        warn!("[CommitLoop] backend commit failed: {:?}", e);
                    }
                }
            }
        }
    })
}
