//! Lease collaborator consumed by write transactions.
//!
//! Lease lifetime management (grant, renew, expiry) lives outside the store;
//! the store only moves keys between leases as they are written and deleted.

use std::collections::HashSet;

use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;

use crate::LeaseError;
use crate::Result;

pub type LeaseId = i64;

/// Lease id of keys without a lease
pub const NO_LEASE: LeaseId = 0;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseItem {
    pub key: Vec<u8>,
}

impl LeaseItem {
    pub fn new(key: &[u8]) -> Self {
        Self { key: key.to_vec() }
    }
}

#[cfg_attr(test, automock)]
pub trait Lessor: Send + Sync + 'static {
    /// Attaches `items` to lease `id`
    fn attach(
        &self,
        id: LeaseId,
        items: Vec<LeaseItem>,
    ) -> Result<()>;

    /// Detaches `items` from lease `id`
    fn detach(
        &self,
        id: LeaseId,
        items: Vec<LeaseItem>,
    ) -> Result<()>;

    /// Lease `item` is attached to, or [`NO_LEASE`]
    fn get_lease(
        &self,
        item: &LeaseItem,
    ) -> LeaseId;
}

/// In-process lessor tracking granted leases and their items
#[derive(Debug, Default)]
pub struct MemLessor {
    leases: DashMap<LeaseId, HashSet<Vec<u8>>>,
    items: DashMap<Vec<u8>, LeaseId>,
}

impl MemLessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(
        &self,
        id: LeaseId,
    ) {
        self.leases.entry(id).or_default();
    }

    /// Keys currently attached to lease `id`
    pub fn keys(
        &self,
        id: LeaseId,
    ) -> Vec<Vec<u8>> {
        let mut keys: Vec<_> = self
            .leases
            .get(&id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

impl Lessor for MemLessor {
    fn attach(
        &self,
        id: LeaseId,
        items: Vec<LeaseItem>,
    ) -> Result<()> {
        let mut keys = self.leases.get_mut(&id).ok_or(LeaseError::LeaseNotFound(id))?;
        for item in items {
            self.items.insert(item.key.clone(), id);
            keys.insert(item.key);
        }
        Ok(())
    }

    fn detach(
        &self,
        id: LeaseId,
        items: Vec<LeaseItem>,
    ) -> Result<()> {
        let mut keys = self.leases.get_mut(&id).ok_or(LeaseError::LeaseNotFound(id))?;
        for item in items {
            if !keys.remove(&item.key) {
                return Err(LeaseError::ItemNotAttached {
                    lease_id: id,
                    key: item.key,
                }
                .into());
            }
            self.items.remove_if(&item.key, |_, lease| *lease == id);
        }
        Ok(())
    }

    fn get_lease(
        &self,
        item: &LeaseItem,
    ) -> LeaseId {
        self.items.get(&item.key).map(|id| *id).unwrap_or(NO_LEASE)
    }
}
