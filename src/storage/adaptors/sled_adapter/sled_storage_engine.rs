use std::collections::HashMap;

use parking_lot::RwLock;
use sled::Batch;
use tracing::debug;
use tracing::instrument;
use tracing::trace;

use crate::Bucket;
use crate::Result;
use crate::StorageEngine;
use crate::StorageError;
use crate::WriteOp;

/// Persistent engine: one sled tree per bucket inside a single database
pub struct SledStorageEngine {
    db: sled::Db,
    trees: RwLock<HashMap<Bucket, sled::Tree>>,
}

impl std::fmt::Debug for SledStorageEngine {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("SledStorageEngine")
            .field("buckets", &self.trees.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SledStorageEngine {
    pub fn new(db: sled::Db) -> Self {
        Self {
            db,
            trees: RwLock::new(HashMap::new()),
        }
    }

    fn tree(
        &self,
        bucket: Bucket,
    ) -> Result<sled::Tree> {
        self.trees.read().get(&bucket).cloned().ok_or_else(|| {
            StorageError::DbError(format!("bucket {} does not exist", bucket.name())).into()
        })
    }

    /// On-disk size of the database, for diagnostics
    pub fn db_size(&self) -> Result<u64> {
        Ok(self.db.size_on_disk()?)
    }
}

impl StorageEngine for SledStorageEngine {
    #[instrument(skip(self))]
    fn create_bucket(
        &self,
        bucket: Bucket,
    ) -> Result<()> {
        let mut trees = self.trees.write();
        if !trees.contains_key(&bucket) {
            debug!("open sled tree {}", bucket.name());
            let tree = self.db.open_tree(bucket.name())?;
            trees.insert(bucket, tree);
        }
        Ok(())
    }

    fn get(
        &self,
        bucket: Bucket,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        Ok(self.tree(bucket)?.get(key)?.map(|ivec| ivec.to_vec()))
    }

    #[instrument(skip(self, start, end))]
    fn range(
        &self,
        bucket: Bucket,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let tree = self.tree(bucket)?;

        if !end.is_empty() && start >= end {
            return Ok(Vec::new());
        }
        let iter = if end.is_empty() {
            tree.range(start..)
        } else {
            tree.range(start..end)
        };

        let mut pairs = Vec::new();
        for item in iter {
            let (k, v) = item?;
            pairs.push((k.to_vec(), v.to_vec()));
            if limit > 0 && pairs.len() >= limit {
                break;
            }
        }
        Ok(pairs)
    }

    #[instrument(skip(self, ops))]
    fn apply_batch(
        &self,
        bucket: Bucket,
        ops: Vec<WriteOp>,
    ) -> Result<()> {
        trace!("apply_batch len = {:?}", ops.len());

        let mut batch = Batch::default();
        for op in ops {
            match op {
                WriteOp::Put { key, value } => batch.insert(key, value),
                WriteOp::Delete { key } => batch.remove(key),
            }
        }
        self.tree(bucket)?.apply_batch(batch)?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn flush(&self) -> Result<()> {
        trace!("SledStorageEngine flush");
        self.db.flush()?;
        Ok(())
    }
}
