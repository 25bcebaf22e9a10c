//! MVCC Store Error Hierarchy
//!
//! Defines the error types surfaced by the multi-version store, categorized by
//! layer: infrastructure (storage, leases), revision semantics and watch
//! stream validation.

use config::ConfigError;
use tokio::task::JoinError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Infrastructure-level failures (storage, serialization, leases)
    #[error(transparent)]
    System(#[from] SystemError),

    /// Configuration loading and validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Revision and history violations
    #[error(transparent)]
    Mvcc(#[from] MvccError),

    /// Watch stream validation failures
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MvccError {
    /// Requested revision predates the retained history
    #[error("mvcc: required revision has been compacted (compact revision: {compact_revision})")]
    Compacted { compact_revision: i64 },

    /// Requested revision is newer than the store revision
    #[error("mvcc: required revision {revision} is a future revision (current: {current})")]
    FutureRevision { revision: i64, current: i64 },

    /// No value visible for the key at the requested revision
    #[error("mvcc: revision not found")]
    RevisionNotFound,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WatchError {
    #[error("mvcc: watcher does not exist")]
    WatcherNotExist,

    #[error("mvcc: duplicate watch ID provided on the WatchStream")]
    WatcherDuplicateId,

    #[error("mvcc: watcher range is empty")]
    EmptyWatcherRange,

    #[error("mvcc: watch stream is closed")]
    StreamClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Disk I/O failures
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Serialization failures for persisted metadata
    #[error(transparent)]
    BincodeError(#[from] bincode::Error),

    /// Decoding failures for persisted key-value records
    #[error("Record decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Embedded database errors
    #[error("Embedded database error: {0}")]
    DbError(String),

    /// Unexpected on-disk content
    #[error("Data corruption detected at {location}")]
    DataCorruption { location: String },

    /// Error type for value conversion operations
    #[error("Value convert failed")]
    Convert(#[from] ConvertError),

    /// Background commit task failures
    #[error("Background task failed: {0}")]
    TaskFailed(#[from] JoinError),
}

/// Error type for value conversion operations
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    /// Input byte slice is shorter than an encoded revision
    #[error("invalid byte length: expected {expected} bytes, received {actual} bytes")]
    InvalidLength { expected: usize, actual: usize },

    /// Generic conversion failure with detailed message
    #[error("conversion failure: {0}")]
    ConversionFailure(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("lease {0} not found")]
    LeaseNotFound(i64),

    #[error("lease {lease_id} is not attached to key {key:?}")]
    ItemNotAttached { lease_id: i64, key: Vec<u8> },
}

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    // Storage layer
    #[error("Storage operation failed: {0}")]
    Storage(#[from] StorageError),

    // Lease collaborator
    #[error("Lease operation failed: {0}")]
    Lease(#[from] LeaseError),

    #[error("Store is closed")]
    Closed,
}

// ============== Conversion Implementations ============== //
impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Error::System(SystemError::Storage(e))
    }
}

impl From<ConvertError> for Error {
    fn from(e: ConvertError) -> Self {
        Error::System(SystemError::Storage(StorageError::Convert(e)))
    }
}

impl From<LeaseError> for Error {
    fn from(e: LeaseError) -> Self {
        Error::System(SystemError::Lease(e))
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        StorageError::Decode(e).into()
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        StorageError::BincodeError(e).into()
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        StorageError::DbError(err.to_string()).into()
    }
}

impl From<JoinError> for Error {
    fn from(err: JoinError) -> Self {
        StorageError::TaskFailed(err).into()
    }
}

impl Error {
    /// Returns the revision error carried by this error, if any.
    pub fn as_mvcc(&self) -> Option<&MvccError> {
        match self {
            Error::Mvcc(e) => Some(e),
            _ => None,
        }
    }

    /// Returns the watch stream error carried by this error, if any.
    pub fn as_watch(&self) -> Option<&WatchError> {
        match self {
            Error::Watch(e) => Some(e),
            _ => None,
        }
    }
}
