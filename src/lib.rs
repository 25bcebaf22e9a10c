//! A multi-version, transactional key-value store with watch streams.
//!
//! Writes are grouped into transactions, each producing a new store revision.
//! Any past revision that has not been compacted can be read, and watchers
//! observe every change on a key or key range from a chosen revision on.

mod config;
pub(crate) mod constants;
mod errors;
mod metrics;
mod mvcc;
mod storage;

pub use config::*;
pub use constants::MARKED_REV_BYTES_LEN;
pub use constants::REV_BYTES_LEN;
pub use errors::*;
pub use metrics::*;
pub use mvcc::*;
pub use storage::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub(crate) mod test_utils;
