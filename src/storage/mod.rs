//! Durable byte backend of the multi-version store.
//!
//! A [`StorageEngine`] persists raw bucketed key/value pairs. [`Backend`] layers
//! a single-writer batch transaction and a read buffer of written-back but not
//! yet committed records on top of it, so reads observe every finished write
//! transaction while engine commits stay batched.
mod adaptors;
mod backend;
mod storage_engine;

pub use adaptors::*;
pub use backend::*;
pub use storage_engine::*;

#[cfg(test)]
pub(crate) mod storage_engine_test;
