use std::fmt;

use crate::constants::MARKED_REV_BYTES_LEN;
use crate::constants::MARK_TOMBSTONE;
use crate::constants::REV_BYTES_LEN;
use crate::ConvertError;

/// Position of a change in the store history.
///
/// `main` is the store revision of the write transaction, `sub` the index of
/// the change inside it. Ordered by `(main, sub)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision {
    pub main: i64,
    pub sub: i64,
}

impl Revision {
    pub const fn new(
        main: i64,
        sub: i64,
    ) -> Self {
        Self { main, sub }
    }

    /// Backend key: big-endian `main`, `'_'`, big-endian `sub`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(MARKED_REV_BYTES_LEN);
        bytes.extend_from_slice(&self.main.to_be_bytes());
        bytes.push(b'_');
        bytes.extend_from_slice(&self.sub.to_be_bytes());
        bytes
    }

    /// Backend key of the tombstone record written at this revision
    pub fn to_tombstone_bytes(&self) -> Vec<u8> {
        let mut bytes = self.to_bytes();
        bytes.push(MARK_TOMBSTONE);
        bytes
    }

    /// Decodes a backend key, ignoring any trailing tombstone mark
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConvertError> {
        if bytes.len() < REV_BYTES_LEN {
            return Err(ConvertError::InvalidLength {
                expected: REV_BYTES_LEN,
                actual: bytes.len(),
            });
        }
        let (main, rest) = bytes.split_at(8);
        let sub = &rest[1..REV_BYTES_LEN - 8];

        Ok(Self {
            main: i64::from_be_bytes(to_array(main)?),
            sub: i64::from_be_bytes(to_array(sub)?),
        })
    }
}

fn to_array(bytes: &[u8]) -> Result<[u8; 8], ConvertError> {
    bytes
        .try_into()
        .map_err(|_| ConvertError::ConversionFailure(format!("{} bytes is not an i64", bytes.len())))
}

/// Whether a backend key marks a deletion
pub fn is_tombstone(bytes: &[u8]) -> bool {
    bytes.len() == MARKED_REV_BYTES_LEN && bytes[MARKED_REV_BYTES_LEN - 1] == MARK_TOMBSTONE
}

impl fmt::Display for Revision {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}_{}", self.main, self.sub)
    }
}
