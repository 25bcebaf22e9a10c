#[cfg(test)]
use mockall::automock;

use crate::constants::KEY_BUCKET_NAME;
use crate::constants::META_BUCKET_NAME;
use crate::Result;

/// Namespaces of the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bucket {
    /// Revision bytes -> encoded key-value record
    Key,
    /// Store metadata such as compaction progress
    Meta,
}

impl Bucket {
    pub const ALL: [Bucket; 2] = [Bucket::Key, Bucket::Meta];

    pub fn name(&self) -> &'static str {
        match self {
            Bucket::Key => KEY_BUCKET_NAME,
            Bucket::Meta => META_BUCKET_NAME,
        }
    }
}

/// A single mutation applied to a bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl WriteOp {
    pub fn key(&self) -> &[u8] {
        match self {
            WriteOp::Put { key, .. } => key,
            WriteOp::Delete { key } => key,
        }
    }
}

/// Raw ordered storage used by [`crate::Backend`].
///
/// Keys are compared byte-lexicographically. An empty `end` in [`range`]
/// means the scan is unbounded above.
///
/// [`range`]: StorageEngine::range
#[cfg_attr(test, automock)]
pub trait StorageEngine: Send + Sync + 'static {
    fn create_bucket(
        &self,
        bucket: Bucket,
    ) -> Result<()>;

    fn get(
        &self,
        bucket: Bucket,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>>;

    /// Returns pairs in `[start, end)` in ascending key order, at most `limit`
    /// of them when `limit > 0`.
    fn range(
        &self,
        bucket: Bucket,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Applies all operations atomically
    fn apply_batch(
        &self,
        bucket: Bucket,
        ops: Vec<WriteOp>,
    ) -> Result<()>;

    /// Makes every applied batch durable
    fn flush(&self) -> Result<()>;
}
