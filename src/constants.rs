// -
// Database namespaces

/// Sled tree holding revision -> key-value records
pub(crate) const KEY_BUCKET_NAME: &str = "key";
/// Sled tree holding store metadata
pub(crate) const META_BUCKET_NAME: &str = "meta";

/// Meta bucket entry keys
pub(crate) const SCHEDULED_COMPACT_KEY: &[u8] = b"scheduledCompactRev";
pub(crate) const FINISHED_COMPACT_KEY: &[u8] = b"finishedCompactRev";

/// Sled database directory under the configured data dir
pub(crate) const STORAGE_ENGINE_DIR: &str = "storage_engine";

/// Revision bytes layout: big-endian main, '_' separator, big-endian sub
pub const REV_BYTES_LEN: usize = 8 + 1 + 8;
pub const MARKED_REV_BYTES_LEN: usize = REV_BYTES_LEN + 1;
pub(crate) const MARK_TOMBSTONE: u8 = b't';

/// Store revision right after bootstrap
pub(crate) const INITIAL_REVISION: i64 = 1;
