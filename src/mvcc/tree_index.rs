use std::collections::BTreeMap;
use std::collections::HashSet;
use std::ops::Bound;

use parking_lot::RwLock;
use tracing::debug;

use super::KeyIndex;
use crate::MvccError;
use crate::Result;
use crate::Revision;

/// Ordered, concurrent map from user key to its [`KeyIndex`].
///
/// Range bounds follow the store convention: `end == None` addresses `key`
/// alone, an empty `end` scans every key `>= key`, otherwise `[key, end)`.
#[derive(Debug, Default)]
pub struct TreeIndex {
    tree: RwLock<BTreeMap<Vec<u8>, KeyIndex>>,
}

fn key_range<'a>(
    key: &'a [u8],
    end: &'a [u8],
) -> Option<(Bound<&'a [u8]>, Bound<&'a [u8]>)> {
    if end.is_empty() {
        return Some((Bound::Included(key), Bound::Unbounded));
    }
    (key < end).then_some((Bound::Included(key), Bound::Excluded(end)))
}

impl TreeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(
        &self,
        key: &[u8],
        rev: Revision,
    ) -> Result<()> {
        let mut tree = self.tree.write();
        tree.entry(key.to_vec())
            .or_insert_with(|| KeyIndex::new(key.to_vec()))
            .put(rev)
    }

    /// Returns `(modified, created, version)` of `key` as of `at_rev`
    pub fn get(
        &self,
        key: &[u8],
        at_rev: i64,
    ) -> Result<(Revision, Revision, i64)> {
        let tree = self.tree.read();
        match tree.get(key) {
            Some(ki) => ki.get(at_rev),
            None => Err(MvccError::RevisionNotFound.into()),
        }
    }

    pub fn tombstone(
        &self,
        key: &[u8],
        rev: Revision,
    ) -> Result<()> {
        let mut tree = self.tree.write();
        match tree.get_mut(key) {
            Some(ki) => ki.tombstone(rev),
            None => Err(MvccError::RevisionNotFound.into()),
        }
    }

    /// Visits key indexes in `[key, end)` in ascending key order until `f`
    /// returns false.
    fn visit<F>(
        &self,
        key: &[u8],
        end: &[u8],
        mut f: F,
    ) where
        F: FnMut(&KeyIndex) -> bool,
    {
        let Some(bounds) = key_range(key, end) else {
            return;
        };
        let tree = self.tree.read();
        for (_, ki) in tree.range::<[u8], _>(bounds) {
            if !f(ki) {
                break;
            }
        }
    }

    /// Returns the live keys and their modified revisions as of `at_rev`
    pub fn range(
        &self,
        key: &[u8],
        end: Option<&[u8]>,
        at_rev: i64,
    ) -> (Vec<Vec<u8>>, Vec<Revision>) {
        let Some(end) = end else {
            return match self.get(key, at_rev) {
                Ok((rev, _, _)) => (vec![key.to_vec()], vec![rev]),
                Err(_) => (Vec::new(), Vec::new()),
            };
        };

        let mut keys = Vec::new();
        let mut revs = Vec::new();
        self.visit(key, end, |ki| {
            if let Ok((rev, _, _)) = ki.get(at_rev) {
                keys.push(ki.key().to_vec());
                revs.push(rev);
            }
            true
        });
        (keys, revs)
    }

    /// Returns up to `limit` modified revisions of live keys as of `at_rev`
    /// (`limit <= 0` means no limit) and the total number of live keys.
    pub fn revisions(
        &self,
        key: &[u8],
        end: Option<&[u8]>,
        at_rev: i64,
        limit: i64,
    ) -> (Vec<Revision>, usize) {
        let Some(end) = end else {
            return match self.get(key, at_rev) {
                Ok((rev, _, _)) => (vec![rev], 1),
                Err(_) => (Vec::new(), 0),
            };
        };

        let mut revs = Vec::new();
        let mut total = 0;
        self.visit(key, end, |ki| {
            if let Ok((rev, _, _)) = ki.get(at_rev) {
                if limit <= 0 || (revs.len() as i64) < limit {
                    revs.push(rev);
                }
                total += 1;
            }
            true
        });
        (revs, total)
    }

    /// Number of live keys in the range as of `at_rev`
    pub fn count_revisions(
        &self,
        key: &[u8],
        end: Option<&[u8]>,
        at_rev: i64,
    ) -> usize {
        let Some(end) = end else {
            return usize::from(self.get(key, at_rev).is_ok());
        };

        let mut total = 0;
        self.visit(key, end, |ki| {
            if ki.get(at_rev).is_ok() {
                total += 1;
            }
            true
        });
        total
    }

    /// Every revision `>= rev` of the matching keys, sorted
    pub fn range_since(
        &self,
        key: &[u8],
        end: Option<&[u8]>,
        rev: i64,
    ) -> Vec<Revision> {
        let Some(end) = end else {
            let tree = self.tree.read();
            return tree.get(key).map(|ki| ki.since(rev)).unwrap_or_default();
        };

        let mut revs = Vec::new();
        self.visit(key, end, |ki| {
            revs.extend(ki.since(rev));
            true
        });
        revs.sort();
        revs
    }

    /// Compacts every key index at `rev`, drops the emptied ones and returns
    /// the revisions that must stay in the backend.
    pub fn compact(
        &self,
        rev: i64,
    ) -> HashSet<Revision> {
        let mut available = HashSet::new();
        debug!("store.index: compact {}", rev);

        let mut tree = self.tree.write();
        tree.retain(|_, ki| {
            ki.compact(rev, &mut available);
            !ki.is_empty()
        });
        available
    }

    /// Inserts a rebuilt key index, replacing any previous one
    pub fn insert(
        &self,
        ki: KeyIndex,
    ) {
        self.tree.write().insert(ki.key().to_vec(), ki);
    }

    /// Applies `f` to the index of `key`, if present
    pub fn update<F>(
        &self,
        key: &[u8],
        f: F,
    ) -> Option<Result<()>>
    where
        F: FnOnce(&mut KeyIndex) -> Result<()>,
    {
        self.tree.write().get_mut(key).map(f)
    }

    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.read().is_empty()
    }
}
