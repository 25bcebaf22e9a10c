//! Transactional views of the multi-version store.

use crate::LeaseId;
use crate::ReadTxMode;
use crate::Result;

/// Stored record of one key at one revision.
///
/// Encoded with protobuf field numbers compatible with the etcd `mvccpb`
/// key-value message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct KeyValue {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    /// Revision of the put that created the current generation of the key
    #[prost(int64, tag = "2")]
    pub create_revision: i64,
    /// Revision of the last modification
    #[prost(int64, tag = "3")]
    pub mod_revision: i64,
    /// Number of puts in the current generation
    #[prost(int64, tag = "4")]
    pub version: i64,
    #[prost(bytes = "vec", tag = "5")]
    pub value: Vec<u8>,
    #[prost(int64, tag = "6")]
    pub lease: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RangeOptions {
    /// Maximum number of records returned; `<= 0` means no limit
    pub limit: i64,
    /// Revision to read at; `<= 0` means the transaction revision
    pub rev: i64,
    /// Only count matching keys
    pub count: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeResult {
    pub kvs: Vec<KeyValue>,
    /// Number of matching keys, regardless of the limit
    pub count: usize,
    /// Revision of the transaction that served the range
    pub rev: i64,
}

pub trait ReadView {
    /// The first revision of the store. Reads below it fail with
    /// [`crate::MvccError::Compacted`].
    fn first_rev(&self) -> i64;

    /// The revision the view was opened at
    fn rev(&self) -> i64;

    /// Gets the keys in `[key, end)` visible at `opts.rev`.
    ///
    /// `end == None` reads `key` alone and an empty `end` reads every key
    /// `>= key`. A future `opts.rev` fails with
    /// [`crate::MvccError::FutureRevision`].
    fn range(
        &self,
        key: &[u8],
        end: Option<&[u8]>,
        opts: RangeOptions,
    ) -> Result<RangeResult>;
}

/// Read-only transaction pinned at one revision
pub trait TxnRead: ReadView {
    /// Releases the transaction
    fn end(self) -> Result<()>
    where
        Self: Sized;
}

pub trait WriteView {
    /// Deletes the keys in the range. Returns the number of deleted keys and
    /// the revision of the transaction.
    fn delete_range(
        &mut self,
        key: &[u8],
        end: Option<&[u8]>,
    ) -> Result<(i64, i64)>;

    /// Puts `value` at `key`, attached to `lease` unless it is
    /// [`crate::NO_LEASE`]. Returns the revision of the transaction.
    fn put(
        &mut self,
        key: &[u8],
        value: &[u8],
        lease: LeaseId,
    ) -> Result<i64>;
}

/// Read-write transaction. Its changes become visible on
/// [`TxnRead::end`], committed as one store revision.
pub trait TxnWrite: TxnRead + WriteView {
    /// Records written so far, ordered by sub revision
    fn changes(&self) -> &[KeyValue];
}

/// A transactional, multi-version key-value store
pub trait KV: Send + Sync {
    type ReadTxn<'a>: TxnRead
    where
        Self: 'a;
    type WriteTxn<'a>: TxnWrite
    where
        Self: 'a;

    /// Opens a read transaction pinned at the current revision
    fn read(
        &self,
        mode: ReadTxMode,
    ) -> Self::ReadTxn<'_>;

    /// Opens the write transaction, waiting for the writer slot
    fn write(&self) -> Self::WriteTxn<'_>;

    /// Current revision of the store
    fn rev(&self) -> i64;

    /// Discards history before `rev`
    fn compact(
        &self,
        rev: i64,
    ) -> Result<()>;

    /// Commits pending writes to durable storage
    fn commit(&self) -> Result<()>;

    fn range(
        &self,
        key: &[u8],
        end: Option<&[u8]>,
        opts: RangeOptions,
    ) -> Result<RangeResult> {
        let txn = self.read(ReadTxMode::Concurrent);
        let result = txn.range(key, end, opts);
        txn.end()?;
        result
    }

    fn put(
        &self,
        key: &[u8],
        value: &[u8],
        lease: LeaseId,
    ) -> Result<i64> {
        let mut txn = self.write();
        let rev = txn.put(key, value, lease);
        txn.end()?;
        rev
    }

    fn delete_range(
        &self,
        key: &[u8],
        end: Option<&[u8]>,
    ) -> Result<(i64, i64)> {
        let mut txn = self.write();
        let result = txn.delete_range(key, end);
        txn.end()?;
        result
    }
}
