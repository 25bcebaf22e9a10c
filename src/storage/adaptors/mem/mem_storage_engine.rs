use std::collections::BTreeMap;
use std::collections::HashMap;
use std::ops::Bound;

use parking_lot::RwLock;
use tracing::trace;

use crate::Bucket;
use crate::Result;
use crate::StorageEngine;
use crate::StorageError;
use crate::WriteOp;

/// Volatile engine backed by one ordered map per bucket
#[derive(Debug, Default)]
pub struct MemStorageEngine {
    buckets: RwLock<HashMap<Bucket, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemStorageEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing_bucket(bucket: Bucket) -> crate::Error {
    StorageError::DbError(format!("bucket {} does not exist", bucket.name())).into()
}

impl StorageEngine for MemStorageEngine {
    fn create_bucket(
        &self,
        bucket: Bucket,
    ) -> Result<()> {
        self.buckets.write().entry(bucket).or_default();
        Ok(())
    }

    fn get(
        &self,
        bucket: Bucket,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let buckets = self.buckets.read();
        let tree = buckets.get(&bucket).ok_or_else(|| missing_bucket(bucket))?;
        Ok(tree.get(key).cloned())
    }

    fn range(
        &self,
        bucket: Bucket,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let buckets = self.buckets.read();
        let tree = buckets.get(&bucket).ok_or_else(|| missing_bucket(bucket))?;

        if !end.is_empty() && start >= end {
            return Ok(Vec::new());
        }
        let upper = if end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end)
        };

        let iter = tree
            .range::<[u8], _>((Bound::Included(start), upper))
            .map(|(k, v)| (k.clone(), v.clone()));
        let pairs = if limit > 0 {
            iter.take(limit).collect()
        } else {
            iter.collect()
        };
        Ok(pairs)
    }

    fn apply_batch(
        &self,
        bucket: Bucket,
        ops: Vec<WriteOp>,
    ) -> Result<()> {
        trace!("apply_batch bucket={} ops={}", bucket.name(), ops.len());

        let mut buckets = self.buckets.write();
        let tree = buckets.get_mut(&bucket).ok_or_else(|| missing_bucket(bucket))?;
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    tree.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    tree.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
