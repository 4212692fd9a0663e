//! Read-only key/value databases backed by minimal perfect hash functions.
//!
//! `mphdb` builds constant databases over 64-bit keys: feed key/value pairs
//! to a [`DbWriter`], freeze it, and reopen the resulting file with a
//! [`DbReader`] for O(1) lookups against a memory-mapped index. Keys are
//! opaque fingerprints: hash your application keys down to `u64` with any
//! keyed 64-bit hash you like. Values are byte strings; databases built
//! from empty values double as compact sets.
//!
//! Two index constructions are available behind the same interface:
//! **CHD** (compress-hash-displace, a packed table of tiny per-bucket
//! seeds) and **BBHash** (stacked rank bit vectors). Both are also usable
//! standalone through [`ChdBuilder`]/[`BbHashBuilder`] and the
//! [`Mph`]/[`MphBuilder`] traits when the database wrapper is not wanted.
//!
//! Every value record carries a SipHash-2-4 checksum and the metadata is
//! sealed with SHA-512/256, so torn or tampered files are rejected at open
//! or at first fetch, never served.
//!
//! ```
//! use mphdb::{DbReader, DbWriter};
//!
//! # fn main() -> mphdb::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let path = dir.path().join("fruits.db");
//!
//! let mut w = DbWriter::create_chd(&path, 0.9)?;
//! w.add(0x5ca1ab1e, b"apple")?;
//! w.add(0xcafef00d, b"banana")?;
//! w.freeze()?;
//!
//! let db = DbReader::open(&path, 128)?;
//! assert_eq!(db.find(0xcafef00d)?, Some(b"banana".to_vec()));
//! assert!(db.find(0xdeadbeef).is_err());
//! # Ok(())
//! # }
//! ```

/// File magic for databases indexed with CHD.
pub(crate) const MAGIC_CHD: [u8; 4] = *b"MPHC";

/// File magic for databases indexed with BBHash.
pub(crate) const MAGIC_BBHASH: [u8; 4] = *b"MPHB";

/// Header flag bit: the database stores keys only, no value records.
pub(crate) const FLAG_KEYS_ONLY: u32 = 1;

mod bbhash;
mod bitvec;
mod chd;
mod error;
mod hasher;
mod mph;
mod reader;
mod writer;

pub use bbhash::{BbHash, BbHashBuilder};
pub use chd::{Chd, ChdBuilder};
pub use error::{Error, Result};
pub use mph::{Mph, MphBuilder};
pub use reader::{DbReader, Entries};
pub use writer::DbWriter;
