//! Multi-version key-value store.
//!
//! Every write transaction that changes something produces a new store
//! revision. [`TreeIndex`] maps each key to the revisions of its changes,
//! while the records themselves live in the backend keyed by [`Revision`].
//! [`WatchableStore`] streams committed changes to watchers, replaying
//! history for watchers that start in the past.
mod event;
mod key_index;
mod kv;
mod kvstore;
mod kvstore_txn;
mod lease;
mod revision;
mod tree_index;
mod watchable_store;
mod watcher;
mod watcher_group;

pub use event::*;
pub use key_index::*;
pub use kv::*;
pub use kvstore::*;
pub use kvstore_txn::*;
pub use lease::*;
pub use revision::*;
pub use tree_index::*;
pub use watchable_store::*;
pub use watcher::*;
pub use watcher_group::*;

#[cfg(test)]
mod kvstore_test;
#[cfg(test)]
mod watcher_group_test;
