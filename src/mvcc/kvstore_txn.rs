use parking_lot::RwLockReadGuard;
use prost::Message;
use tracing::error;
use tracing::warn;

use super::KeyValue;
use super::LeaseId;
use super::LeaseItem;
use super::RangeOptions;
use super::RangeResult;
use super::ReadView;
use super::Revision;
use super::Store;
use super::TxnRead;
use super::TxnWrite;
use super::WriteView;
use super::NO_LEASE;
use crate::metrics::DELETE_COUNTER;
use crate::metrics::PUT_COUNTER;
use crate::metrics::RANGE_COUNTER;
use crate::BatchTx;
use crate::Bucket;
use crate::MvccError;
use crate::ReadTx;
use crate::ReadTxMode;
use crate::Result;
use crate::StorageError;
use crate::UnsafeReader;

impl Store {
    /// Resolves the keys of `[key, end)` visible at `opts.rev` through `tx`.
    ///
    /// `cur_rev` and `compact_main` are the revisions the calling transaction
    /// was pinned at. Compaction cannot move while a transaction is open.
    fn range_keys<T: UnsafeReader>(
        &self,
        tx: &T,
        key: &[u8],
        end: Option<&[u8]>,
        (cur_rev, compact_main): (i64, i64),
        opts: RangeOptions,
    ) -> Result<RangeResult> {
        RANGE_COUNTER.inc();

        if opts.rev > cur_rev {
            return Err(MvccError::FutureRevision {
                revision: opts.rev,
                current: cur_rev,
            }
            .into());
        }
        let rev = if opts.rev <= 0 { cur_rev } else { opts.rev };

        if rev < compact_main {
            return Err(MvccError::Compacted {
                compact_revision: compact_main,
            }
            .into());
        }

        if opts.count {
            return Ok(RangeResult {
                kvs: Vec::new(),
                count: self.kv_index.count_revisions(key, end, rev),
                rev: cur_rev,
            });
        }

        let (revs, total) = self.kv_index.revisions(key, end, rev, opts.limit);
        let mut kvs = Vec::with_capacity(revs.len());
        for r in revs {
            let pairs = tx.unsafe_range(Bucket::Key, &r.to_bytes(), None, 0)?;
            let Some((_, value)) = pairs.into_iter().next() else {
                return Err(StorageError::DataCorruption {
                    location: format!("key bucket, revision {r}"),
                }
                .into());
            };
            kvs.push(KeyValue::decode(value.as_slice())?);
        }

        Ok(RangeResult {
            kvs,
            count: total,
            rev: cur_rev,
        })
    }
}

/// Read transaction pinned at the store revision it was opened at
pub struct StoreTxnRead<'a> {
    store: &'a Store,
    tx: ReadTx<'a>,
    first_rev: i64,
    rev: i64,
    _mu: RwLockReadGuard<'a, ()>,
}

impl<'a> StoreTxnRead<'a> {
    pub(crate) fn new(
        store: &'a Store,
        mode: ReadTxMode,
    ) -> Self {
        let mu = store.mu.read();
        // the buffer is captured under the revision lock so it holds every
        // write-back up to `rev`
        let revs = store.revs.read();
        let tx = store.backend.read_tx(mode);
        let (first_rev, rev) = (revs.compact_main, revs.current);
        drop(revs);

        Self {
            store,
            tx,
            first_rev,
            rev,
            _mu: mu,
        }
    }
}

impl ReadView for StoreTxnRead<'_> {
    fn first_rev(&self) -> i64 {
        self.first_rev
    }

    fn rev(&self) -> i64 {
        self.rev
    }

    fn range(
        &self,
        key: &[u8],
        end: Option<&[u8]>,
        opts: RangeOptions,
    ) -> Result<RangeResult> {
        self.store
            .range_keys(&self.tx, key, end, (self.rev, self.first_rev), opts)
    }
}

impl TxnRead for StoreTxnRead<'_> {
    fn end(self) -> Result<()> {
        Ok(())
    }
}

/// The write transaction. Holds the backend writer slot until it ends.
pub struct StoreTxnWrite<'a> {
    store: &'a Store,
    tx: Option<BatchTx<'a>>,
    first_rev: i64,
    begin_rev: i64,
    changes: Vec<KeyValue>,
    published: bool,
    _mu: RwLockReadGuard<'a, ()>,
}

impl<'a> StoreTxnWrite<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        let mu = store.mu.read();
        let tx = store.backend.batch_tx();
        let revs = *store.revs.read();

        Self {
            store,
            tx: Some(tx),
            first_rev: revs.compact_main,
            begin_rev: revs.current,
            changes: Vec::new(),
            published: false,
            _mu: mu,
        }
    }

    /// Revision this transaction commits at, if it changes anything
    pub(crate) fn commit_rev(&self) -> i64 {
        self.begin_rev + 1
    }

    fn batch_tx(&mut self) -> Result<&mut BatchTx<'a>> {
        self.tx.as_mut().ok_or_else(|| crate::SystemError::Closed.into())
    }

    /// Publishes the changes as a new store revision without releasing the
    /// writer slot. No revision is consumed without changes.
    pub(crate) fn publish(&mut self) {
        if self.published || self.changes.is_empty() {
            return;
        }
        let store = self.store;
        let Some(tx) = self.tx.as_mut() else {
            return;
        };

        // readers may not open until the changes are written back
        let mut revs = store.revs.write();
        tx.write_back();
        revs.current += 1;
        self.published = true;
    }

    /// Publishes the changes and releases the writer slot, committing to the
    /// engine once the backend batch limit is reached.
    pub(crate) fn finish(&mut self) -> Result<()> {
        self.publish();
        match self.tx.take() {
            Some(tx) => tx.unlock(),
            None => Ok(()),
        }
    }

    fn put_record(
        &mut self,
        key: &[u8],
        value: &[u8],
        lease: LeaseId,
    ) -> Result<()> {
        let rev = self.begin_rev + 1;
        let item = LeaseItem::new(key);

        // a recreated key starts a new generation
        let (create_revision, version) = match self.store.kv_index.get(key, rev) {
            Ok((_, created, ver)) => (created.main, ver + 1),
            Err(_) => (rev, 1),
        };

        let old_lease = match &self.store.lessor {
            Some(lessor) => lessor.get_lease(&item),
            None => NO_LEASE,
        };
        if let Some(lessor) = &self.store.lessor {
            if lease != NO_LEASE && lease != old_lease {
                lessor.attach(lease, vec![item.clone()])?;
            }
        }

        let idx = Revision::new(rev, self.changes.len() as i64);
        let kv = KeyValue {
            key: key.to_vec(),
            create_revision,
            mod_revision: rev,
            version,
            value: value.to_vec(),
            lease,
        };
        let encoded = kv.encode_to_vec();
        self.batch_tx()?.unsafe_seq_put(Bucket::Key, &idx.to_bytes(), &encoded);
        self.store.kv_index.put(key, idx)?;
        self.changes.push(kv);

        if let Some(lessor) = &self.store.lessor {
            if old_lease != NO_LEASE && old_lease != lease {
                if let Err(e) = lessor.detach(old_lease, vec![item]) {
                    warn!("failed to detach old lease {} from key: {:?}", old_lease, e);
                }
            }
        }

        PUT_COUNTER.inc();
        Ok(())
    }

    fn delete_range_keys(
        &mut self,
        key: &[u8],
        end: Option<&[u8]>,
    ) -> Result<i64> {
        let mut rrev = self.begin_rev;
        if !self.changes.is_empty() {
            rrev += 1;
        }

        let (keys, _) = self.store.kv_index.range(key, end, rrev);
        for key in &keys {
            self.delete(key)?;
        }
        Ok(keys.len() as i64)
    }

    fn delete(
        &mut self,
        key: &[u8],
    ) -> Result<()> {
        let idx = Revision::new(self.begin_rev + 1, self.changes.len() as i64);
        let kv = KeyValue {
            key: key.to_vec(),
            ..Default::default()
        };
        let encoded = kv.encode_to_vec();

        self.batch_tx()?
            .unsafe_seq_put(Bucket::Key, &idx.to_tombstone_bytes(), &encoded);
        self.store.kv_index.tombstone(key, idx)?;
        self.changes.push(kv);

        if let Some(lessor) = &self.store.lessor {
            let item = LeaseItem::new(key);
            let lease = lessor.get_lease(&item);
            if lease != NO_LEASE {
                if let Err(e) = lessor.detach(lease, vec![item]) {
                    warn!("failed to detach lease {} from deleted key: {:?}", lease, e);
                }
            }
        }

        DELETE_COUNTER.inc();
        Ok(())
    }
}

impl ReadView for StoreTxnWrite<'_> {
    fn first_rev(&self) -> i64 {
        self.first_rev
    }

    fn rev(&self) -> i64 {
        self.begin_rev
    }

    /// Reads at the in-progress revision, own changes included
    fn range(
        &self,
        key: &[u8],
        end: Option<&[u8]>,
        opts: RangeOptions,
    ) -> Result<RangeResult> {
        let mut rev = self.begin_rev;
        if !self.changes.is_empty() {
            rev += 1;
        }
        let tx = self.tx.as_ref().ok_or(crate::SystemError::Closed)?;
        self.store.range_keys(tx, key, end, (rev, self.first_rev), opts)
    }
}

impl WriteView for StoreTxnWrite<'_> {
    fn delete_range(
        &mut self,
        key: &[u8],
        end: Option<&[u8]>,
    ) -> Result<(i64, i64)> {
        let n = self.delete_range_keys(key, end)?;
        if n != 0 || !self.changes.is_empty() {
            return Ok((n, self.begin_rev + 1));
        }
        Ok((0, self.begin_rev))
    }

    fn put(
        &mut self,
        key: &[u8],
        value: &[u8],
        lease: LeaseId,
    ) -> Result<i64> {
        self.put_record(key, value, lease)?;
        Ok(self.begin_rev + 1)
    }
}

impl TxnRead for StoreTxnWrite<'_> {
    fn end(mut self) -> Result<()> {
        self.finish()
    }
}

impl TxnWrite for StoreTxnWrite<'_> {
    fn changes(&self) -> &[KeyValue] {
        &self.changes
    }
}

impl Drop for StoreTxnWrite<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            error!("write transaction failed to end on drop: {:?}", e);
        }
    }
}
