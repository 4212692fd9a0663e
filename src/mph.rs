//! The builder/table interface shared by both hash constructions.
//!
//! The database writer and reader only ever talk to these traits; users who
//! want a perfect hash without the database wrapper can use
//! [`ChdBuilder`](crate::ChdBuilder) or
//! [`BbHashBuilder`](crate::BbHashBuilder) directly.

use std::io::Write;

use crate::bbhash::BbHash;
use crate::chd::Chd;
use crate::error::{Error, Result};
use crate::{MAGIC_BBHASH, MAGIC_CHD};

/// Accumulates keys and freezes them into an immutable lookup table.
pub trait MphBuilder {
    /// Adds a key. Keys must be distinct; duplicates are the caller's
    /// responsibility to reject.
    fn add(&mut self, key: u64) -> Result<()>;

    /// Consumes the builder and constructs the lookup table.
    fn freeze(self: Box<Self>) -> Result<Box<dyn Mph>>;
}

/// A frozen perfect-hash lookup table.
pub trait Mph: Send + Sync {
    /// Maps `key` to its slot.
    ///
    /// The result is meaningful only for keys that were in the builder's
    /// key set; any other key returns `None` or an arbitrary in-range slot,
    /// so callers must confirm a hit by checking the key stored at the
    /// returned index.
    fn find(&self, key: u64) -> Option<u64>;

    /// Size of the slot space `find` maps into.
    fn len(&self) -> usize;

    /// Whether the table holds no slots.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes the table in its portable form; the writer is expected to sit
    /// at a u64-aligned offset. Returns the bytes written.
    fn marshal(&self, w: &mut dyn Write) -> std::io::Result<usize>;

    /// Writes a human-readable description of the table.
    fn dump_meta(&self, w: &mut dyn Write) -> std::io::Result<()>;
}

/// Reconstructs the table variant selected by the database magic.
pub(crate) fn mph_from_bytes(magic: [u8; 4], buf: &[u8]) -> Result<Box<dyn Mph>> {
    match magic {
        MAGIC_CHD => Ok(Box::new(Chd::from_bytes(buf)?)),
        MAGIC_BBHASH => Ok(Box::new(BbHash::from_bytes(buf)?)),
        other => Err(Error::BadMagic(other)),
    }
}
