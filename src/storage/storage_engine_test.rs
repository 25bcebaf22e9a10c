use std::sync::Arc;

use crate::storage::StorageEngine;
use crate::Bucket;
use crate::Error;
use crate::WriteOp;

/// Test suite for StorageEngine implementations
///
/// Every engine implementation provides a `StorageEngineBuilder` and runs
/// `StorageEngineTestSuite::run_all_tests` with it.
pub struct StorageEngineTestSuite;

/// Builder trait for creating StorageEngine instances for testing
pub trait StorageEngineBuilder: Send + Sync {
    type Engine: StorageEngine;

    fn build(&self) -> Result<Arc<Self::Engine>, Error>;

    fn cleanup(&self) -> Result<(), Error>;
}

fn put(
    key: &[u8],
    value: &[u8],
) -> WriteOp {
    WriteOp::Put {
        key: key.to_vec(),
        value: value.to_vec(),
    }
}

fn with_buckets<E: StorageEngine>(engine: Arc<E>) -> Result<Arc<E>, Error> {
    for bucket in Bucket::ALL {
        engine.create_bucket(bucket)?;
    }
    Ok(engine)
}

impl StorageEngineTestSuite {
    pub fn run_all_tests<B: StorageEngineBuilder>(builder: B) -> Result<(), Error> {
        Self::test_empty_storage(with_buckets(builder.build()?)?)?;
        Self::test_put_and_get(with_buckets(builder.build()?)?)?;
        Self::test_range_bounds(with_buckets(builder.build()?)?)?;
        Self::test_range_limit(with_buckets(builder.build()?)?)?;
        Self::test_delete(with_buckets(builder.build()?)?)?;
        Self::test_create_bucket_is_idempotent(with_buckets(builder.build()?)?)?;

        builder.cleanup()?;
        Ok(())
    }

    fn test_empty_storage<E: StorageEngine>(engine: Arc<E>) -> Result<(), Error> {
        assert_eq!(engine.get(Bucket::Key, b"missing")?, None);
        assert!(engine.range(Bucket::Key, b"", b"", 0)?.is_empty());
        engine.flush()?;
        Ok(())
    }

    fn test_put_and_get<E: StorageEngine>(engine: Arc<E>) -> Result<(), Error> {
        engine.apply_batch(Bucket::Key, vec![put(b"a", b"1"), put(b"b", b"2")])?;

        assert_eq!(engine.get(Bucket::Key, b"a")?, Some(b"1".to_vec()));
        assert_eq!(engine.get(Bucket::Key, b"b")?, Some(b"2".to_vec()));

        // later writes in one batch win
        engine.apply_batch(Bucket::Key, vec![put(b"a", b"x"), put(b"a", b"y")])?;
        assert_eq!(engine.get(Bucket::Key, b"a")?, Some(b"y".to_vec()));
        Ok(())
    }

    fn test_range_bounds<E: StorageEngine>(engine: Arc<E>) -> Result<(), Error> {
        engine.apply_batch(
            Bucket::Key,
            vec![put(b"a", b"1"), put(b"b", b"2"), put(b"c", b"3"), put(b"d", b"4")],
        )?;

        let keys = |pairs: Vec<(Vec<u8>, Vec<u8>)>| -> Vec<Vec<u8>> {
            pairs.into_iter().map(|(k, _)| k).collect()
        };

        assert_eq!(
            keys(engine.range(Bucket::Key, b"b", b"d", 0)?),
            vec![b"b".to_vec(), b"c".to_vec()]
        );
        assert_eq!(
            keys(engine.range(Bucket::Key, b"c", b"", 0)?),
            vec![b"c".to_vec(), b"d".to_vec()]
        );
        assert!(engine.range(Bucket::Key, b"d", b"b", 0)?.is_empty());
        assert!(engine.range(Bucket::Key, b"b", b"b", 0)?.is_empty());
        Ok(())
    }

    fn test_range_limit<E: StorageEngine>(engine: Arc<E>) -> Result<(), Error> {
        let ops = (0u8..10).map(|i| put(&[i], &[i])).collect();
        engine.apply_batch(Bucket::Key, ops)?;

        let pairs = engine.range(Bucket::Key, &[0], b"", 3)?;
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[2], (vec![2], vec![2]));
        Ok(())
    }

    fn test_delete<E: StorageEngine>(engine: Arc<E>) -> Result<(), Error> {
        engine.apply_batch(Bucket::Key, vec![put(b"a", b"1"), put(b"b", b"2")])?;
        engine.apply_batch(
            Bucket::Key,
            vec![
                WriteOp::Delete { key: b"a".to_vec() },
                WriteOp::Delete {
                    key: b"not-there".to_vec(),
                },
            ],
        )?;

        assert_eq!(engine.get(Bucket::Key, b"a")?, None);
        assert_eq!(engine.range(Bucket::Key, b"", b"", 0)?.len(), 1);
        Ok(())
    }

    fn test_create_bucket_is_idempotent<E: StorageEngine>(engine: Arc<E>) -> Result<(), Error> {
        engine.apply_batch(Bucket::Meta, vec![put(b"m", b"1")])?;
        engine.create_bucket(Bucket::Meta)?;

        assert_eq!(engine.get(Bucket::Meta, b"m")?, Some(b"1".to_vec()));
        Ok(())
    }
}
