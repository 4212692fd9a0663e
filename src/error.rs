use std::io;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by builders, the database writer and the database reader.
///
/// Corrupted or truncated input files are always reported through one of
/// these variants; the reader never panics on malformed data.
#[derive(Debug, Error)]
pub enum Error {
    /// A mutating call was made on a writer that is no longer open.
    #[error("database is frozen")]
    Frozen,

    /// The key is already present in the database under construction.
    #[error("key {0:#018x} already exists")]
    Exists(u64),

    /// The value does not fit the 32-bit record length.
    #[error("value of {0} bytes exceeds the record size limit")]
    ValueTooLarge(usize),

    /// The key is not present in the database.
    #[error("no such key")]
    NoKey,

    /// The load factor passed to the CHD builder is outside (0, 1].
    #[error("invalid load factor {0}")]
    BadLoadFactor(f64),

    /// Construction of the minimal perfect hash gave up; retrying with a
    /// fresh builder (and therefore a fresh salt) usually succeeds.
    #[error("no perfect hash after {attempts} attempts")]
    MphFail { attempts: u32 },

    /// The buffer is too short to unmarshal the requested structure.
    #[error("not enough data to unmarshal: need {need} bytes, have {have}")]
    TooSmall { need: usize, have: usize },

    /// The file does not start with a recognized magic number.
    #[error("bad file magic {0:02x?}")]
    BadMagic([u8; 4]),

    /// The marshaled structure declares an unsupported version.
    #[error("unsupported format version {0}")]
    BadVersion(u8),

    /// The marshaled CHD declares a seed width other than 1, 2 or 4 bytes.
    #[error("invalid seed size {0}")]
    BadSeedSize(u8),

    /// Structural validation of a header or table failed.
    #[error("{0}")]
    Corrupted(String),

    /// The whole-metadata digest does not match the file trailer.
    #[error("metadata checksum mismatch")]
    Checksum,

    /// A value record failed its integrity check.
    #[error("corrupted record at offset {0:#x}")]
    CorruptRecord(u64),

    /// An underlying I/O operation failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}
