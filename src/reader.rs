//! Query interface for a frozen database.
//!
//! Opening a database verifies the header and the whole-metadata digest,
//! memory-maps the offset table (it was page-aligned by the writer for this
//! reason) and reconstructs the MPHF from the tail of the mapping. Lookups
//! probe the MPHF, confirm the stored key, and fetch the value record with a
//! positioned read, verifying its SipHash checksum on the way; small hot
//! values are served from an LRU cache.
//!
//! The reader is immutable after open and safe to share across threads:
//! the mapping and the MPHF are read-only and the cache carries its own
//! lock. Dropping the reader unmaps the table, closes the file and discards
//! the cache.

use std::fs::File;
use std::io::Write;
use std::num::NonZeroUsize;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use lru::LruCache;
#[cfg(unix)]
use memmap2::Advice;
use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;
use sha2::{Digest, Sha512_256};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};
use crate::hasher::record_checksum;
use crate::mph::{mph_from_bytes, Mph};
use crate::{FLAG_KEYS_ONLY, MAGIC_BBHASH, MAGIC_CHD};

/// Cache capacity used when the caller passes 0.
const DEFAULT_CACHE: usize = 128;

/// Reader for a database produced by [`DbWriter`](crate::DbWriter).
pub struct DbReader {
    mph: Box<dyn Mph>,
    cache: Mutex<LruCache<u64, Option<Vec<u8>>>>,
    // Declared before `file` so the table unmaps before the descriptor
    // closes.
    map: Mmap,
    file: File,
    flags: u32,
    salt: [u8; 16],
    nkeys: u64,
    offtbl: u64,
    path: PathBuf,
}

impl DbReader {
    /// Opens the database at `path` and verifies its metadata.
    ///
    /// Up to `cache_entries` values (or keys-only hits) are kept in memory;
    /// 0 selects the default of 128.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadMagic`], [`Error::Corrupted`] or
    /// [`Error::Checksum`] for files that are not intact databases, and
    /// [`Error::Io`] when the file cannot be read or mapped.
    pub fn open<P: AsRef<Path>>(path: P, cache_entries: usize) -> Result<DbReader> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        if size < 64 + 32 {
            return Err(Error::Corrupted(format!(
                "{}: too small to be a database ({size} bytes)",
                path.display()
            )));
        }

        let mut hdr = [0u8; 64];
        file.read_exact_at(&mut hdr, 0)?;

        let magic: [u8; 4] = hdr[..4].try_into().unwrap();
        if magic != MAGIC_CHD && magic != MAGIC_BBHASH {
            return Err(Error::BadMagic(magic));
        }
        let flags = u32::from_be_bytes(hdr[4..8].try_into().unwrap());
        let salt: [u8; 16] = hdr[8..24].try_into().unwrap();
        let nkeys = u64::from_be_bytes(hdr[24..32].try_into().unwrap());
        let offtbl = u64::from_be_bytes(hdr[32..40].try_into().unwrap());
        if offtbl < 64 || offtbl >= size - 32 {
            return Err(Error::Corrupted(format!(
                "{}: offset table position {offtbl:#x} out of bounds",
                path.display()
            )));
        }

        verify_checksum(&file, &hdr, offtbl, size)?;

        // The digest vouches for the metadata, but stay defensive about
        // arithmetic on header-derived sizes.
        let entry = if flags & FLAG_KEYS_ONLY != 0 { 8 } else { 20 };
        let tblsz = nkeys
            .checked_mul(entry)
            .filter(|&t| t <= size - 64 - 32 && offtbl + t <= size - 32)
            .ok_or_else(|| {
                Error::Corrupted(format!(
                    "{}: offset table of {nkeys} slots does not fit the file",
                    path.display()
                ))
            })?;

        let map = unsafe {
            MmapOptions::new()
                .offset(offtbl)
                .len((size - 32 - offtbl) as usize)
                .map(&file)?
        };
        #[cfg(unix)]
        map.advise(Advice::WillNeed)?;

        // The marshaled MPHF starts at the next u64 boundary past the table
        // (the writer pads the gap with zeros).
        let mph_off = ((tblsz + 7) & !7) as usize;
        if mph_off > map.len() {
            return Err(Error::Corrupted(format!(
                "{}: no room for the hash index",
                path.display()
            )));
        }
        let mph = mph_from_bytes(magic, &map[mph_off..])?;

        let cap = if cache_entries == 0 {
            DEFAULT_CACHE
        } else {
            cache_entries
        };
        let cache = LruCache::new(NonZeroUsize::new(cap).unwrap_or(NonZeroUsize::MIN));

        Ok(DbReader {
            mph,
            cache: Mutex::new(cache),
            map,
            file,
            flags,
            salt,
            nkeys,
            offtbl,
            path,
        })
    }

    /// Size of the slot space, as recorded in the header.
    ///
    /// For BBHash databases this equals the number of keys; for CHD it is
    /// the (larger, power-of-two) index table size, so empty slots exist
    /// and iteration can yield fewer entries than `len()`.
    pub fn len(&self) -> usize {
        self.nkeys as usize
    }

    /// Whether the database holds no slots.
    pub fn is_empty(&self) -> bool {
        self.nkeys == 0
    }

    fn keys_only(&self) -> bool {
        self.flags & FLAG_KEYS_ONLY != 0
    }

    // Offset-table accessors. The table is little-endian on disk so these
    // are plain loads on x86/arm64; on big-endian hosts `from_le_bytes`
    // swaps element-wise. Slot bounds were validated against the mapping
    // at open.

    #[inline]
    fn u64_at(&self, pos: usize) -> u64 {
        u64::from_le_bytes(self.map[pos..pos + 8].try_into().unwrap())
    }

    #[inline]
    fn u32_at(&self, pos: usize) -> u32 {
        u32::from_le_bytes(self.map[pos..pos + 4].try_into().unwrap())
    }

    #[inline]
    fn key_at(&self, slot: u64) -> u64 {
        if self.keys_only() {
            self.u64_at(slot as usize * 8)
        } else {
            self.u64_at(slot as usize * 16)
        }
    }

    #[inline]
    fn record_off_at(&self, slot: u64) -> u64 {
        self.u64_at(slot as usize * 16 + 8)
    }

    #[inline]
    fn vlen_at(&self, slot: u64) -> u32 {
        self.u32_at(self.nkeys as usize * 16 + slot as usize * 4)
    }

    /// Looks up `key` and returns its value.
    ///
    /// `Ok(None)` means the key is present in a keys-only database.
    ///
    /// The key value 0 doubles as the empty-slot marker in the offset
    /// table. Keys+values lookups still resolve a genuine key 0 through its
    /// record offset, but keys-only lookups cannot tell it apart from an
    /// unused slot, so there `find(0)` always reports [`Error::NoKey`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoKey`] when the key is absent,
    /// [`Error::CorruptRecord`] when the stored record fails its integrity
    /// check, and [`Error::Io`] when the record cannot be read.
    pub fn find(&self, key: u64) -> Result<Option<Vec<u8>>> {
        if let Some(hit) = self.cache.lock().get(&key) {
            return Ok(hit.clone());
        }

        let slot = self.mph.find(key).ok_or(Error::NoKey)?;
        if slot >= self.nkeys {
            return Err(Error::NoKey);
        }

        if self.keys_only() {
            // An all-zero slot is an unused one; without a record offset to
            // consult, a query for key 0 matching it would read as present.
            if key == 0 || self.key_at(slot) != key {
                return Err(Error::NoKey);
            }
            self.cache.lock().put(key, None);
            return Ok(None);
        }

        if self.key_at(slot) != key {
            return Err(Error::NoKey);
        }
        let off = self.record_off_at(slot);
        let vlen = self.vlen_at(slot);
        let val = if vlen == 0 {
            // Zero-length values have no record bytes on disk. An all-zero
            // slot can only be reached by querying key 0, which is the
            // empty-slot sentinel.
            if off == 0 {
                return Err(Error::NoKey);
            }
            Vec::new()
        } else {
            self.read_record(off, vlen)?
        };

        self.cache.lock().put(key, Some(val.clone()));
        Ok(Some(val))
    }

    /// Infallible form of [`find`](Self::find): `Some` when the key is
    /// present (the empty vector for keys-only databases), `None` when it
    /// is absent or its record cannot be read intact.
    pub fn lookup(&self, key: u64) -> Option<Vec<u8>> {
        match self.find(key) {
            Ok(Some(v)) => Some(v),
            Ok(None) => Some(Vec::new()),
            Err(_) => None,
        }
    }

    /// Reads a record at `off` and verifies its leading checksum.
    fn read_record(&self, off: u64, vlen: u32) -> Result<Vec<u8>> {
        let mut data = vec![0u8; 8 + vlen as usize];
        self.file.read_exact_at(&mut data, off)?;

        let expect = record_checksum(&self.salt, off, &data[8..]).to_be_bytes();
        if !bool::from(data[..8].ct_eq(&expect)) {
            return Err(Error::CorruptRecord(off));
        }
        data.drain(..8);
        Ok(data)
    }

    /// Iterates over the stored entries in slot order.
    ///
    /// Slots whose stored key is 0 are treated as empty and skipped; the
    /// key value 0 is reserved as that sentinel. Values are read (and
    /// verified) from disk as the iterator advances, so items are
    /// `Result`s.
    pub fn iter(&self) -> Entries<'_> {
        Entries { db: self, slot: 0 }
    }

    /// Writes a human-readable summary of the database followed by its
    /// offset table.
    pub fn dump_meta(&self, w: &mut dyn Write) -> std::io::Result<()> {
        let kind = if self.keys_only() {
            "keys"
        } else {
            "keys+values"
        };
        writeln!(
            w,
            "{}: <{kind}> {} slots, offset table at {:#x}, salt {:02x?}",
            self.path.display(),
            self.nkeys,
            self.offtbl,
            self.salt,
        )?;
        self.mph.dump_meta(w)?;

        for slot in 0..self.nkeys {
            if self.keys_only() {
                writeln!(w, "  {slot:4}: {:#018x}", self.key_at(slot))?;
            } else {
                writeln!(
                    w,
                    "  {slot:4}: {:#018x} {} bytes at {:#x}",
                    self.key_at(slot),
                    self.vlen_at(slot),
                    self.record_off_at(slot),
                )?;
            }
        }
        Ok(())
    }
}

/// Iterator over the entries of a [`DbReader`], created by
/// [`DbReader::iter`].
pub struct Entries<'a> {
    db: &'a DbReader,
    slot: u64,
}

impl Iterator for Entries<'_> {
    type Item = Result<(u64, Option<Vec<u8>>)>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.slot < self.db.nkeys {
            let slot = self.slot;
            self.slot += 1;

            let key = self.db.key_at(slot);
            if key == 0 {
                continue; // empty slot
            }
            if self.db.keys_only() {
                return Some(Ok((key, None)));
            }

            let vlen = self.db.vlen_at(slot);
            let val = if vlen == 0 {
                Vec::new()
            } else {
                match self.db.read_record(self.db.record_off_at(slot), vlen) {
                    Ok(v) => v,
                    Err(e) => return Some(Err(e)),
                }
            };
            return Some(Ok((key, Some(val))));
        }
        None
    }
}

/// Streams `header ‖ bytes[offtbl..size-32)` through SHA-512/256 and
/// compares the digest against the file trailer in constant time.
fn verify_checksum(file: &File, hdr: &[u8; 64], offtbl: u64, size: u64) -> Result<()> {
    let mut sha = Sha512_256::new();
    sha.update(hdr);

    let mut buf = vec![0u8; 64 * 1024];
    let mut pos = offtbl;
    let mut remaining = size - 32 - offtbl;
    while remaining > 0 {
        let n = remaining.min(buf.len() as u64) as usize;
        file.read_exact_at(&mut buf[..n], pos)?;
        sha.update(&buf[..n]);
        pos += n as u64;
        remaining -= n as u64;
    }

    let mut expect = [0u8; 32];
    file.read_exact_at(&mut expect, size - 32)?;
    if !bool::from(sha.finalize().as_slice().ct_eq(&expect)) {
        return Err(Error::Checksum);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs::OpenOptions;
    use std::hash::BuildHasher;
    use std::path::Path;

    use foldhash::fast::FixedState;

    use super::*;
    use crate::hasher::rand_u64;
    use crate::writer::DbWriter;

    const WORDS: [&str; 20] = [
        "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
        "juliett", "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo",
        "sierra", "tango",
    ];

    fn word_keys() -> Vec<(u64, &'static str)> {
        let state = FixedState::with_seed(rand_u64());
        WORDS.iter().map(|&w| (state.hash_one(w), w)).collect()
    }

    fn flip_byte(path: &Path, pos: u64) {
        let f = OpenOptions::new().read(true).write(true).open(path).unwrap();
        let mut b = [0u8; 1];
        f.read_exact_at(&mut b, pos).unwrap();
        f.write_all_at(&[b[0] ^ 0xff], pos).unwrap();
    }

    fn read_offtbl(path: &Path) -> u64 {
        let f = File::open(path).unwrap();
        let mut hdr = [0u8; 64];
        f.read_exact_at(&mut hdr, 0).unwrap();
        u64::from_be_bytes(hdr[32..40].try_into().unwrap())
    }

    #[test]
    fn test_chd_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("words-chd.db");
        let kv = word_keys();

        let mut w = DbWriter::create_chd(&path, 0.9).unwrap();
        for &(k, v) in &kv {
            w.add(k, v.as_bytes()).unwrap();
        }
        assert_eq!(w.len(), kv.len());
        w.freeze().unwrap();

        let rd = DbReader::open(&path, 10).unwrap();
        assert!(rd.len() >= kv.len());
        for &(k, v) in &kv {
            assert_eq!(rd.find(k).unwrap().unwrap(), v.as_bytes());
            assert_eq!(rd.lookup(k).unwrap(), v.as_bytes());
        }
        for k in 0..10u64 {
            assert!(matches!(rd.find(k), Err(Error::NoKey)), "found bogus {k}");
            assert!(rd.lookup(k).is_none());
        }
    }

    #[test]
    fn test_bbhash_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("words-bbh.db");
        let kv = word_keys();

        let mut w = DbWriter::create_bbhash(&path, 2.0).unwrap();
        for &(k, v) in &kv {
            w.add(k, v.as_bytes()).unwrap();
        }
        w.freeze().unwrap();

        let rd = DbReader::open(&path, 0).unwrap();
        assert_eq!(rd.len(), kv.len());
        for &(k, v) in &kv {
            assert_eq!(rd.find(k).unwrap().unwrap(), v.as_bytes());
        }
    }

    #[test]
    fn test_keys_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");
        let kv = word_keys();

        let mut w = DbWriter::create_bbhash(&path, 2.0).unwrap();
        for &(k, _) in &kv {
            w.add(k, b"").unwrap();
        }
        w.freeze().unwrap();

        let rd = DbReader::open(&path, 10).unwrap();
        for &(k, _) in &kv {
            assert!(rd.find(k).unwrap().is_none());
            // cached hit takes the same shape
            assert!(rd.find(k).unwrap().is_none());
            assert_eq!(rd.lookup(k), Some(Vec::new()));
        }
        for _ in 0..10 {
            let k = rand_u64();
            if kv.iter().any(|&(h, _)| h == k) {
                continue;
            }
            assert!(matches!(rd.find(k), Err(Error::NoKey)));
        }
    }

    #[test]
    fn test_keys_only_chd() {
        // CHD tables are wider than the key set, so the offset table has
        // unused all-zero slots; key 0 must not match them.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys-chd.db");
        let kv = word_keys();

        let mut w = DbWriter::create_chd(&path, 0.9).unwrap();
        for &(k, _) in &kv {
            w.add(k, b"").unwrap();
        }
        w.freeze().unwrap();

        let rd = DbReader::open(&path, 10).unwrap();
        assert!(rd.len() > kv.len(), "expected unused slots");
        for &(k, _) in &kv {
            assert!(rd.find(k).unwrap().is_none());
        }
        assert!(matches!(rd.find(0), Err(Error::NoKey)));
        assert_eq!(rd.iter().count(), kv.len());
        for _ in 0..10 {
            let k = rand_u64();
            if kv.iter().any(|&(h, _)| h == k) {
                continue;
            }
            assert!(matches!(rd.find(k), Err(Error::NoKey)));
        }
    }

    #[test]
    fn test_iteration_medium() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.db");

        let state = FixedState::with_seed(rand_u64());
        let mut expect: HashMap<u64, String> = HashMap::new();
        for i in 0..65_535u32 {
            let host = format!("host-{i}.internal:10.{}.{}.{}", i >> 16, (i >> 8) & 0xff, i & 0xff);
            expect.insert(state.hash_one(&host), host);
        }
        assert_eq!(expect.len(), 65_535, "hash collision in test corpus");

        let mut w = DbWriter::create_chd(&path, 0.85).unwrap();
        for (&k, host) in &expect {
            w.add(k, host.as_bytes()).unwrap();
        }
        assert_eq!(w.len(), 65_535);
        w.freeze().unwrap();

        let rd = DbReader::open(&path, 100).unwrap();
        assert!(rd.len() >= 65_535);

        let mut seen = 0usize;
        for entry in rd.iter() {
            let (k, v) = entry.unwrap();
            assert_eq!(expect[&k].as_bytes(), v.unwrap());
            seen += 1;
        }
        assert_eq!(seen, 65_535);
    }

    #[test]
    fn test_corrupt_metadata_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tamper-meta.db");
        let kv = word_keys();

        let mut w = DbWriter::create_chd(&path, 0.9).unwrap();
        for &(k, v) in &kv {
            w.add(k, v.as_bytes()).unwrap();
        }
        w.freeze().unwrap();

        let offtbl = read_offtbl(&path);
        flip_byte(&path, offtbl + 100);
        assert!(matches!(
            DbReader::open(&path, 0),
            Err(Error::Checksum)
        ));
    }

    #[test]
    fn test_corrupt_record_fails_find() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tamper-rec.db");
        let kv = word_keys();

        let mut w = DbWriter::create_bbhash(&path, 2.0).unwrap();
        for &(k, v) in &kv {
            w.add(k, v.as_bytes()).unwrap();
        }
        w.freeze().unwrap();

        // The first record sits right after the header: checksum at 64,
        // value bytes from 72.
        flip_byte(&path, 72);

        let rd = DbReader::open(&path, 0).unwrap();
        let (bad_key, _) = kv[0];
        assert!(matches!(rd.find(bad_key), Err(Error::CorruptRecord(64))));
        for &(k, v) in &kv[1..] {
            assert_eq!(rd.find(k).unwrap().unwrap(), v.as_bytes());
        }
    }

    #[test]
    fn test_mixed_empty_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.db");
        let kv = word_keys();

        let mut w = DbWriter::create_bbhash(&path, 2.0).unwrap();
        for (i, &(k, v)) in kv.iter().enumerate() {
            let val = if i % 2 == 0 { v.as_bytes() } else { b"" };
            w.add(k, val).unwrap();
        }
        w.freeze().unwrap();

        let rd = DbReader::open(&path, 0).unwrap();
        for (i, &(k, v)) in kv.iter().enumerate() {
            let got = rd.find(k).unwrap().unwrap();
            if i % 2 == 0 {
                assert_eq!(got, v.as_bytes());
            } else {
                assert!(got.is_empty());
            }
        }
    }

    #[test]
    fn test_empty_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.db");

        let mut w = DbWriter::create_chd(&path, 0.9).unwrap();
        w.freeze().unwrap();

        let rd = DbReader::open(&path, 0).unwrap();
        assert!(matches!(rd.find(12345), Err(Error::NoKey)));
        assert_eq!(rd.iter().count(), 0);
    }

    #[test]
    fn test_single_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("one.db");
        let key = rand_u64() | 1; // keep away from the empty-slot sentinel

        let mut w = DbWriter::create_bbhash(&path, 2.0).unwrap();
        w.add(key, b"lonely").unwrap();
        w.freeze().unwrap();

        let rd = DbReader::open(&path, 0).unwrap();
        assert_eq!(rd.len(), 1);
        assert_eq!(rd.find(key).unwrap().unwrap(), b"lonely");
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("missing.db");
        assert!(matches!(DbReader::open(&missing, 0), Err(Error::Io(_))));

        let short = dir.path().join("short.db");
        std::fs::write(&short, b"stub").unwrap();
        assert!(matches!(
            DbReader::open(&short, 0),
            Err(Error::Corrupted(_))
        ));

        let junk = dir.path().join("junk.db");
        std::fs::write(&junk, vec![0xabu8; 256]).unwrap();
        assert!(matches!(DbReader::open(&junk, 0), Err(Error::BadMagic(_))));

        // recognizable magic but an out-of-bounds table position
        let evil = dir.path().join("evil.db");
        let mut data = vec![0u8; 256];
        data[..4].copy_from_slice(b"MPHC");
        std::fs::write(&evil, &data).unwrap();
        assert!(matches!(DbReader::open(&evil, 0), Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_dump_meta() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.db");
        let kv = word_keys();

        let mut w = DbWriter::create_bbhash(&path, 2.0).unwrap();
        for &(k, v) in &kv {
            w.add(k, v.as_bytes()).unwrap();
        }
        w.freeze().unwrap();

        let rd = DbReader::open(&path, 0).unwrap();
        let mut out = Vec::new();
        rd.dump_meta(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("keys+values"));
        assert!(text.contains("bbhash"));
    }
}
