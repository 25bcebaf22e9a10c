use std::sync::Arc;

use super::KeyValue;

pub type WatchId = i64;

/// Passed to [`crate::WatchStream::watch`] to have an id assigned
pub const AUTO_WATCH_ID: WatchId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Put,
    Delete,
}

/// A single change observed by a watcher.
///
/// For deletions `kv` carries only the key and the deleting revision.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: EventType,
    pub kv: KeyValue,
}

impl Event {
    pub fn is_create(&self) -> bool {
        self.event_type == EventType::Put && self.kv.create_revision == self.kv.mod_revision
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchResponse {
    /// Watcher the response belongs to
    pub watch_id: WatchId,

    /// Events in revision order, possibly empty for progress responses
    pub events: Vec<Event>,

    /// Store revision the watcher has observed up to
    pub revision: i64,

    /// Set when the watcher fell behind a compaction and was removed
    pub compact_revision: i64,

    /// Set on the final response of a canceled watcher
    pub canceled: bool,
}

/// Returns true for events the watcher must not receive
pub type FilterFn = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Drops PUT events
pub fn filter_no_put() -> FilterFn {
    Arc::new(|ev: &Event| ev.event_type == EventType::Put)
}

/// Drops DELETE events
pub fn filter_no_delete() -> FilterFn {
    Arc::new(|ev: &Event| ev.event_type == EventType::Delete)
}
