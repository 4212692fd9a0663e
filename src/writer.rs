//! Construction of the on-disk database.
//!
//! The writer streams checksummed value records into a temporary file while
//! the keys accumulate in the MPHF builder. `freeze` lays down the remaining
//! sections of the file and atomically renames the temporary into place, so
//! a database path either holds a complete, verifiable file or nothing.
//!
//! On-disk layout (all byte offsets from the start of the file):
//!
//! ```text
//! [0, 64)          header, big-endian: magic, flags, 16-byte salt,
//!                  slot count, offset-table position
//! [64, offtbl)     value records: u64 big-endian SipHash-2-4 ‖ value
//! [offtbl, ...)    offset table, little-endian (page-aligned, mmap'd by
//!                  the reader): key/offset u64 pairs then u32 lengths,
//!                  or bare u64 keys for keys-only databases
//! [..., size-32)   marshaled MPHF (u64-aligned)
//! [size-32, size)  SHA-512/256 of header ‖ bytes[offtbl..size-32)
//! ```
//!
//! Records are covered by their own SipHash checksums rather than the
//! trailing digest so that opening a database reads metadata only; values
//! are verified opportunistically as they are fetched.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha512_256};

use crate::bbhash::BbHashBuilder;
use crate::chd::ChdBuilder;
use crate::error::{Error, Result};
use crate::hasher::{rand_salt, rand_u32, record_checksum};
use crate::mph::{Mph, MphBuilder};
use crate::{FLAG_KEYS_ONLY, MAGIC_BBHASH, MAGIC_CHD};

#[derive(Clone, Copy, PartialEq)]
enum State {
    Open,
    Frozen,
    Aborted,
}

/// Per-key record metadata, kept until `freeze` emits the offset table.
struct Rec {
    off: u64,
    vlen: u32,
}

/// Writer for a read-only MPHF database.
///
/// Keys are opaque 64-bit fingerprints supplied by the caller (typically a
/// keyed hash of the application key); values are arbitrary byte strings.
/// When every value is empty the frozen file is flagged keys-only and holds
/// no records at all.
///
/// The writer works in a temporary file next to the target path; the target
/// only appears once [`freeze`](Self::freeze) has completed.
pub struct DbWriter {
    file: Option<File>,
    builder: Option<Box<dyn MphBuilder>>,
    keymap: HashMap<u64, Rec>,
    salt: [u8; 16],
    off: u64,
    val_bytes: u64,
    magic: [u8; 4],
    path: PathBuf,
    tmp_path: PathBuf,
    state: State,
}

impl DbWriter {
    /// Creates a writer whose index is a CHD table with the given load
    /// factor (see [`ChdBuilder::new`]).
    pub fn create_chd<P: AsRef<Path>>(path: P, load: f64) -> Result<DbWriter> {
        Self::create(Box::new(ChdBuilder::new(load)?), path.as_ref(), MAGIC_CHD)
    }

    /// Creates a writer whose index is a BBHash table with the given gamma
    /// (see [`BbHashBuilder::new`]).
    pub fn create_bbhash<P: AsRef<Path>>(path: P, gamma: f64) -> Result<DbWriter> {
        Self::create(
            Box::new(BbHashBuilder::new(gamma)),
            path.as_ref(),
            MAGIC_BBHASH,
        )
    }

    fn create(builder: Box<dyn MphBuilder>, path: &Path, magic: [u8; 4]) -> Result<DbWriter> {
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(format!(".tmp.{:08x}", rand_u32()));
        let tmp_path = PathBuf::from(tmp);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;

        // Reserve the header; it is filled in at freeze time.
        file.write_all(&[0u8; 64])?;

        Ok(DbWriter {
            file: Some(file),
            builder: Some(builder),
            keymap: HashMap::new(),
            salt: rand_salt(),
            off: 64,
            val_bytes: 0,
            magic,
            path: path.to_path_buf(),
            tmp_path,
            state: State::Open,
        })
    }

    /// Number of distinct keys added so far.
    pub fn len(&self) -> usize {
        self.keymap.len()
    }

    /// Whether no keys have been added yet.
    pub fn is_empty(&self) -> bool {
        self.keymap.is_empty()
    }

    /// The final path of the database.
    pub fn filename(&self) -> &Path {
        &self.path
    }

    /// Adds one key/value pair. Pass an empty value for set-style
    /// databases; if every value is empty the frozen file stores no records
    /// and is flagged keys-only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Frozen`] after `freeze` or `abort`,
    /// [`Error::ValueTooLarge`] when the value cannot fit a record, and
    /// [`Error::Exists`] for duplicate keys (checked before any I/O).
    pub fn add(&mut self, key: u64, val: &[u8]) -> Result<()> {
        if self.state != State::Open {
            return Err(Error::Frozen);
        }
        if val.len() as u64 > u64::from(u32::MAX) - 1 {
            return Err(Error::ValueTooLarge(val.len()));
        }
        if self.keymap.contains_key(&key) {
            return Err(Error::Exists(key));
        }

        self.builder.as_mut().ok_or(Error::Frozen)?.add(key)?;

        let off = self.off;
        self.keymap.insert(
            key,
            Rec {
                off,
                vlen: val.len() as u32,
            },
        );

        if !val.is_empty() {
            self.write_record(off, val)?;
        }
        Ok(())
    }

    fn write_record(&mut self, off: u64, val: &[u8]) -> Result<()> {
        let mut file: &File = self.file.as_ref().ok_or(Error::Frozen)?;

        let csum = record_checksum(&self.salt, off, val);
        file.write_all(&csum.to_be_bytes())?;
        file.write_all(val)?;

        self.off += 8 + val.len() as u64;
        self.val_bytes += val.len() as u64;
        Ok(())
    }

    /// Builds the MPHF, writes the remaining file sections and publishes
    /// the database under its final path.
    ///
    /// Any failure (including [`Error::MphFail`] from the index
    /// construction) removes the temporary file and leaves the writer
    /// aborted.
    pub fn freeze(&mut self) -> Result<()> {
        if self.state != State::Open {
            return Err(Error::Frozen);
        }
        match self.freeze_inner() {
            Ok(()) => {
                self.state = State::Frozen;
                Ok(())
            }
            Err(e) => {
                let _ = self.discard();
                Err(e)
            }
        }
    }

    fn freeze_inner(&mut self) -> Result<()> {
        let builder = self.builder.take().ok_or(Error::Frozen)?;
        let mut file = self.file.take().ok_or(Error::Frozen)?;
        let mph = builder.freeze()?;

        // Align the offset table to a page boundary so the reader can mmap
        // it. The gap is part of the record region and stays outside the
        // trailing digest.
        let pg = page_size();
        let offtbl = (self.off + pg - 1) & !(pg - 1);
        if offtbl > self.off {
            write_zeros(&mut file, (offtbl - self.off) as usize)?;
            self.off = offtbl;
        }

        let flags: u32 = if self.val_bytes == 0 { FLAG_KEYS_ONLY } else { 0 };
        let mut hdr = [0u8; 64];
        hdr[..4].copy_from_slice(&self.magic);
        hdr[4..8].copy_from_slice(&flags.to_be_bytes());
        hdr[8..24].copy_from_slice(&self.salt);
        hdr[24..32].copy_from_slice(&(mph.len() as u64).to_be_bytes());
        hdr[32..40].copy_from_slice(&offtbl.to_be_bytes());

        // The digest covers the in-memory header plus everything written
        // from the offset table onward.
        let mut sha = Sha512_256::new();
        sha.update(hdr);

        let table = self.marshal_offsets(&*mph, flags)?;
        sha.update(&table);
        file.write_all(&table)?;
        self.off += table.len() as u64;

        // The marshaled MPHF expects a u64-aligned start.
        let aligned = (self.off + 7) & !7;
        if aligned > self.off {
            let pad = vec![0u8; (aligned - self.off) as usize];
            sha.update(&pad);
            file.write_all(&pad)?;
            self.off = aligned;
        }

        let mut tee = TeeWriter {
            file: &mut file,
            sha: &mut sha,
        };
        let n = mph.marshal(&mut tee)?;
        self.off += n as u64;

        file.write_all(sha.finalize().as_slice())?;
        file.write_all_at(&hdr, 0)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }

    /// Builds the offset table in memory, slot-indexed through the MPHF.
    fn marshal_offsets(&self, mph: &dyn Mph, flags: u32) -> Result<Vec<u8>> {
        let n = mph.len();
        let slot = |key: u64| -> Result<usize> {
            match mph.find(key) {
                Some(i) if (i as usize) < n => Ok(i as usize),
                _ => Err(Error::Corrupted(format!(
                    "frozen index lost key {key:#018x}"
                ))),
            }
        };

        if flags & FLAG_KEYS_ONLY != 0 {
            let mut keys = vec![0u64; n];
            for &k in self.keymap.keys() {
                keys[slot(k)?] = k;
            }
            let mut out = Vec::with_capacity(n * 8);
            for k in keys {
                out.extend_from_slice(&k.to_le_bytes());
            }
            Ok(out)
        } else {
            let mut offs = vec![0u64; 2 * n];
            let mut vlens = vec![0u32; n];
            for (&k, rec) in &self.keymap {
                let i = slot(k)?;
                offs[2 * i] = k;
                offs[2 * i + 1] = rec.off;
                vlens[i] = rec.vlen;
            }
            let mut out = Vec::with_capacity(n * 20);
            for v in offs {
                out.extend_from_slice(&v.to_le_bytes());
            }
            for v in vlens {
                out.extend_from_slice(&v.to_le_bytes());
            }
            Ok(out)
        }
    }

    /// Abandons the construction and removes the temporary file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Frozen`] if the writer already froze or aborted.
    pub fn abort(&mut self) -> Result<()> {
        if self.state != State::Open {
            return Err(Error::Frozen);
        }
        self.discard()
    }

    fn discard(&mut self) -> Result<()> {
        self.state = State::Aborted;
        self.builder = None;
        self.file = None;
        fs::remove_file(&self.tmp_path)?;
        Ok(())
    }
}

impl Drop for DbWriter {
    fn drop(&mut self) {
        if self.state == State::Open {
            let _ = self.discard();
        }
    }
}

/// Forwards writes to the file while folding them into the digest.
struct TeeWriter<'a> {
    file: &'a mut File,
    sha: &'a mut Sha512_256,
}

impl Write for TeeWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.file.write(buf)?;
        self.sha.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

fn write_zeros(file: &mut File, mut n: usize) -> Result<()> {
    let zeros = [0u8; 4096];
    while n > 0 {
        let chunk = n.min(zeros.len());
        file.write_all(&zeros[..chunk])?;
        n -= chunk;
    }
    Ok(())
}

/// System page size, treated as a power of two.
fn page_size() -> u64 {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as u64
    }
}
