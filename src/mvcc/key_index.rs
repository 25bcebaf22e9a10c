//! Revision history of a single key.
//!
//! A key's life is split into generations. Each generation starts with the
//! put that (re)creates the key and ends with a tombstone. The last
//! generation is the open one; it is empty right after a tombstone.
//!
//! For example, put(1.0); put(2.0); tombstone(3.0); put(4.0); tombstone(5.0)
//! on key "foo" produces:
//!
//! ```text
//! key:     "foo"
//! modified: 5.0
//! generations:
//!     {empty}
//!     {4.0, 5.0(t)}
//!     {1.0, 2.0, 3.0(t)}
//! ```

use std::collections::HashSet;

use crate::metrics::KEYS_GAUGE;
use crate::Error;
use crate::MvccError;
use crate::Result;
use crate::Revision;

/// Revisions of one incarnation of a key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generation {
    /// Number of puts in this generation
    pub ver: i64,
    /// Revision of the put that created this generation
    pub created: Revision,
    pub revs: Vec<Revision>,
}

impl Generation {
    pub fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    /// Walks revisions newest to oldest and returns the index of the first one
    /// for which `keep_walking` is false.
    fn walk<F>(
        &self,
        mut keep_walking: F,
    ) -> Option<usize>
    where
        F: FnMut(&Revision) -> bool,
    {
        self.revs.iter().rposition(|rev| !keep_walking(rev))
    }
}

/// History of a key, ordered oldest generation first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyIndex {
    key: Vec<u8>,
    modified: Revision,
    generations: Vec<Generation>,
}

impl KeyIndex {
    pub fn new(key: Vec<u8>) -> Self {
        Self {
            key,
            modified: Revision::default(),
            generations: Vec::new(),
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn modified(&self) -> Revision {
        self.modified
    }

    pub fn generations(&self) -> &[Generation] {
        &self.generations
    }

    /// Records a put at `rev`, which must be newer than every recorded revision.
    pub fn put(
        &mut self,
        rev: Revision,
    ) -> Result<()> {
        if rev <= self.modified {
            return Err(Error::Fatal(format!(
                "put with an unexpected smaller revision {} (modified {}) on key {:?}",
                rev, self.modified, self.key
            )));
        }
        if self.generations.is_empty() {
            self.generations.push(Generation::default());
        }
        let last = self.generations.len() - 1;
        let g = &mut self.generations[last];
        if g.revs.is_empty() {
            KEYS_GAUGE.inc();
            g.created = rev;
        }
        g.revs.push(rev);
        g.ver += 1;
        self.modified = rev;
        Ok(())
    }

    /// Rebuilds an index from the newest record of a live key
    pub fn restore(
        &mut self,
        created: Revision,
        modified: Revision,
        ver: i64,
    ) {
        KEYS_GAUGE.inc();
        self.modified = modified;
        self.generations = vec![Generation {
            ver,
            created,
            revs: vec![modified],
        }];
    }

    /// Ends the open generation with a tombstone at `rev`.
    pub fn tombstone(
        &mut self,
        rev: Revision,
    ) -> Result<()> {
        if rev <= self.modified {
            return Err(Error::Fatal(format!(
                "tombstone with an unexpected smaller revision {} (modified {}) on key {:?}",
                rev, self.modified, self.key
            )));
        }
        match self.generations.last_mut() {
            Some(g) if !g.is_empty() => g.revs.push(rev),
            _ => return Err(MvccError::RevisionNotFound.into()),
        }
        self.modified = rev;
        self.generations.push(Generation::default());
        KEYS_GAUGE.dec();
        Ok(())
    }

    /// Returns `(modified, created, version)` of the key as of `at_rev`.
    pub fn get(
        &self,
        at_rev: i64,
    ) -> Result<(Revision, Revision, i64)> {
        let gi = self
            .find_generation(at_rev)
            .ok_or(MvccError::RevisionNotFound)?;
        let g = &self.generations[gi];
        // a finished generation ends with a tombstone that is not a put
        let tomb = i64::from(gi + 1 != self.generations.len());

        match g.walk(|rev| rev.main > at_rev) {
            Some(n) => {
                let ver = g.ver - (g.revs.len() - n - 1) as i64 + tomb;
                Ok((g.revs[n], g.created, ver))
            }
            None => Err(MvccError::RevisionNotFound.into()),
        }
    }

    /// Returns the revisions since `rev` (inclusive), keeping only the last
    /// change of each main revision.
    pub fn since(
        &self,
        rev: i64,
    ) -> Vec<Revision> {
        if self.is_empty() {
            return Vec::new();
        }
        let since = Revision::new(rev, 0);

        let mut gi = self.generations.len() - 1;
        while gi > 0 {
            let g = &self.generations[gi];
            if !g.is_empty() && since > g.created {
                break;
            }
            gi -= 1;
        }

        let mut revs: Vec<Revision> = Vec::new();
        let mut last = 0;
        for g in &self.generations[gi..] {
            for r in &g.revs {
                if since > *r {
                    continue;
                }
                if r.main == last {
                    // a higher sub of the same main replaces the earlier one
                    if let Some(prev) = revs.last_mut() {
                        *prev = *r;
                    }
                    continue;
                }
                revs.push(*r);
                last = r.main;
            }
        }
        revs
    }

    /// Drops history older than `at_rev` except the newest revision at or before
    /// it in the generation that is still visible. Kept revisions are added to
    /// `available`.
    pub fn compact(
        &mut self,
        at_rev: i64,
        available: &mut HashSet<Revision>,
    ) {
        if self.is_empty() {
            return;
        }

        let (mut gen_idx, rev_idx) = self.do_compact(at_rev, available);
        let last = self.generations.len() - 1;
        let g = &mut self.generations[gen_idx];
        if !g.is_empty() {
            if let Some(rev_idx) = rev_idx {
                g.revs.drain(..rev_idx);
            }
            // a lone tombstone of a finished generation is history, not state
            if g.revs.len() == 1 && gen_idx != last {
                available.remove(&g.revs[0]);
                gen_idx += 1;
            }
        }
        self.generations.drain(..gen_idx);
    }

    fn do_compact(
        &self,
        at_rev: i64,
        available: &mut HashSet<Revision>,
    ) -> (usize, Option<usize>) {
        let mut gen_idx = 0;
        // first generation that includes at_rev or was created after it
        while gen_idx < self.generations.len() - 1 {
            let g = &self.generations[gen_idx];
            match g.revs.last() {
                Some(tomb) if tomb.main > at_rev => break,
                _ => gen_idx += 1,
            }
        }

        let rev_idx = self.generations[gen_idx].walk(|rev| {
            if rev.main <= at_rev {
                available.insert(*rev);
                return false;
            }
            true
        });
        (gen_idx, rev_idx)
    }

    /// True when no generation holds a revision
    pub fn is_empty(&self) -> bool {
        match self.generations.as_slice() {
            [] => true,
            [only] => only.is_empty(),
            _ => false,
        }
    }

    /// Finds the index of the generation whose lifetime covers `rev`
    fn find_generation(
        &self,
        rev: i64,
    ) -> Option<usize> {
        let last = self.generations.len().checked_sub(1)?;

        for (cg, g) in self.generations.iter().enumerate().rev() {
            let (Some(first), Some(tomb)) = (g.revs.first(), g.revs.last()) else {
                continue;
            };
            if cg != last && tomb.main <= rev {
                return None;
            }
            if first.main <= rev {
                return Some(cg);
            }
        }
        None
    }
}
