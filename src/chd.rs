//! Compress-Hash-Displace perfect hashing over 64-bit keys.
//!
//! Keys are bucketed by a zero-seed hash, buckets are processed in
//! decreasing order of occupancy, and each bucket searches for a small seed
//! that displaces all of its keys into free slots. Only the per-slot seeds
//! survive into the frozen table, packed at the narrowest width (8, 16 or
//! 32 bits) that holds the largest seed used.

use std::io::Write;

use crate::bitvec::BitVector;
use crate::error::{Error, Result};
use crate::hasher::{rand_u64, rhash};
use crate::mph::{Mph, MphBuilder};

/// Seed search budget per bucket; also caps the packed seed width.
const MAX_SEED: u32 = 65536 * 2;

const CHD_HEADER_SIZE: usize = 16;

/// Builder accumulating keys for a [`Chd`] table.
///
/// Keys must be distinct; the database writer deduplicates before handing
/// them down. The salt is drawn once per builder, so retrying a failed
/// construction with a fresh builder retries with a fresh salt.
pub struct ChdBuilder {
    keys: Vec<u64>,
    salt: u64,
    load: f64,
}

impl ChdBuilder {
    /// Creates a builder with the given load factor in `(0, 1]`.
    ///
    /// Lower load factors speed up construction at the cost of a larger
    /// table; values between 0.75 and 0.9 work well.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadLoadFactor`] when `load` is outside `(0, 1]`.
    pub fn new(load: f64) -> Result<Self> {
        if !(load > 0.0 && load <= 1.0) {
            return Err(Error::BadLoadFactor(load));
        }
        Ok(ChdBuilder {
            keys: Vec::with_capacity(1024),
            salt: rand_u64(),
            load,
        })
    }

    /// Adds a key.
    pub fn add(&mut self, key: u64) {
        self.keys.push(key);
    }

    /// Consumes the builder and searches for a displacement of every bucket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MphFail`] if some bucket exhausts the seed budget.
    pub fn freeze(self) -> Result<Chd> {
        let m = next_pow2((self.keys.len() as f64 / self.load).ceil() as u64);

        struct Bucket {
            slot: u64,
            keys: Vec<u64>,
        }
        let mut buckets: Vec<Bucket> = (0..m)
            .map(|slot| Bucket {
                slot,
                keys: Vec::new(),
            })
            .collect();
        for &key in &self.keys {
            let j = rhash(0, key, m, self.salt) as usize;
            buckets[j].keys.push(key);
        }

        // Fit the crowded buckets first, while the table is still empty.
        buckets.sort_unstable_by(|a, b| b.keys.len().cmp(&a.keys.len()));

        let occ = BitVector::new(m);
        let b_occ = BitVector::new(m);
        let mut seeds = vec![0u32; m as usize];
        let mut max_seed = 0u32;

        'buckets: for b in &buckets {
            if b.keys.is_empty() {
                // Sorted by occupancy: everything from here on is empty.
                break;
            }
            'seed: for s in 1..MAX_SEED {
                b_occ.reset();
                for &key in &b.keys {
                    let h = rhash(s, key, m, self.salt);
                    if occ.test(h) || b_occ.test(h) {
                        continue 'seed;
                    }
                    b_occ.set(h);
                }
                occ.merge(&b_occ);
                seeds[b.slot as usize] = s;
                max_seed = max_seed.max(s);
                continue 'buckets;
            }
            return Err(Error::MphFail { attempts: MAX_SEED });
        }

        Ok(Chd {
            seeds: Seeds::pack(&seeds, max_seed),
            salt: self.salt,
        })
    }
}

impl MphBuilder for ChdBuilder {
    fn add(&mut self, key: u64) -> Result<()> {
        self.keys.push(key);
        Ok(())
    }

    fn freeze(self: Box<Self>) -> Result<Box<dyn Mph>> {
        Ok(Box::new((*self).freeze()?))
    }
}

/// Frozen CHD table.
///
/// `find` maps every original key to a distinct slot in `[0, len())`, where
/// `len()` is the power-of-two table size chosen at freeze time. Keys
/// outside the original set land on arbitrary slots; callers confirm a hit
/// by comparing the key stored at the returned index.
pub struct Chd {
    seeds: Seeds,
    salt: u64,
}

impl Chd {
    /// Reconstructs a table from its marshaled form.
    ///
    /// The buffer may be a view into a memory-mapped file; the seed table is
    /// copied out, so the returned value does not borrow from `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TooSmall`], [`Error::BadVersion`],
    /// [`Error::BadSeedSize`] or [`Error::Corrupted`] when the buffer does
    /// not hold a valid table.
    pub fn from_bytes(buf: &[u8]) -> Result<Chd> {
        if buf.len() < CHD_HEADER_SIZE {
            return Err(Error::TooSmall {
                need: CHD_HEADER_SIZE,
                have: buf.len(),
            });
        }
        if buf[0] != 1 {
            return Err(Error::BadVersion(buf[0]));
        }
        let seed_size = buf[1];
        if !matches!(seed_size, 1 | 2 | 4) {
            return Err(Error::BadSeedSize(seed_size));
        }
        let nseeds = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
        let salt = u64::from_le_bytes(buf[8..16].try_into().unwrap());

        let body_len = nseeds
            .checked_mul(seed_size as usize)
            .ok_or_else(|| Error::Corrupted(format!("seed table of {nseeds} entries overflows")))?;
        let body = buf
            .get(CHD_HEADER_SIZE..CHD_HEADER_SIZE + body_len)
            .ok_or(Error::TooSmall {
                need: CHD_HEADER_SIZE + body_len,
                have: buf.len(),
            })?;

        Ok(Chd {
            seeds: Seeds::from_bytes(seed_size, body)?,
            salt,
        })
    }
}

impl Mph for Chd {
    fn find(&self, key: u64) -> Option<u64> {
        let m = self.seeds.len() as u64;
        if m == 0 {
            return None;
        }
        let b = rhash(0, key, m, self.salt);
        Some(rhash(self.seeds.seed(b), key, m, self.salt))
    }

    fn len(&self) -> usize {
        self.seeds.len()
    }

    fn marshal(&self, w: &mut dyn Write) -> std::io::Result<usize> {
        let mut hdr = [0u8; CHD_HEADER_SIZE];
        hdr[0] = 1;
        hdr[1] = self.seeds.seed_size();
        hdr[4..8].copy_from_slice(&(self.seeds.len() as u32).to_le_bytes());
        hdr[8..16].copy_from_slice(&self.salt.to_le_bytes());
        w.write_all(&hdr)?;
        Ok(hdr.len() + self.seeds.marshal(w)?)
    }

    fn dump_meta(&self, w: &mut dyn Write) -> std::io::Result<()> {
        writeln!(
            w,
            "  chd: {}-bit seeds, {} slots <salt {:#018x}>",
            self.seeds.seed_size() as usize * 8,
            self.seeds.len(),
            self.salt,
        )
    }
}

/// Packed per-slot seed table; a closed set of three widths.
enum Seeds {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl Seeds {
    /// Packs `seeds` at the narrowest width that holds `max`. The seed
    /// budget keeps every value under 2^18, so the truncating casts below
    /// never discard set bits once the width test passed.
    fn pack(seeds: &[u32], max: u32) -> Seeds {
        if max < 1 << 8 {
            Seeds::U8(seeds.iter().map(|&s| s as u8).collect())
        } else if max < 1 << 16 {
            Seeds::U16(seeds.iter().map(|&s| s as u16).collect())
        } else {
            Seeds::U32(seeds.to_vec())
        }
    }

    fn from_bytes(seed_size: u8, body: &[u8]) -> Result<Seeds> {
        if !matches!(seed_size, 1 | 2 | 4) {
            return Err(Error::BadSeedSize(seed_size));
        }
        if body.len() % seed_size as usize != 0 {
            return Err(Error::Corrupted(format!(
                "partial seed table: {} bytes is not a multiple of the seed size {}",
                body.len(),
                seed_size,
            )));
        }
        match seed_size {
            1 => Ok(Seeds::U8(body.to_vec())),
            2 => Ok(Seeds::U16(
                body.chunks_exact(2)
                    .map(|c| u16::from_le_bytes(c.try_into().unwrap()))
                    .collect(),
            )),
            _ => Ok(Seeds::U32(
                body.chunks_exact(4)
                    .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                    .collect(),
            )),
        }
    }

    #[inline]
    fn seed(&self, slot: u64) -> u32 {
        match self {
            Seeds::U8(v) => v[slot as usize] as u32,
            Seeds::U16(v) => v[slot as usize] as u32,
            Seeds::U32(v) => v[slot as usize],
        }
    }

    fn len(&self) -> usize {
        match self {
            Seeds::U8(v) => v.len(),
            Seeds::U16(v) => v.len(),
            Seeds::U32(v) => v.len(),
        }
    }

    fn seed_size(&self) -> u8 {
        match self {
            Seeds::U8(_) => 1,
            Seeds::U16(_) => 2,
            Seeds::U32(_) => 4,
        }
    }

    fn marshal(&self, w: &mut dyn Write) -> std::io::Result<usize> {
        let body = match self {
            Seeds::U8(v) => v.clone(),
            Seeds::U16(v) => {
                let mut b = Vec::with_capacity(v.len() * 2);
                for s in v {
                    b.extend_from_slice(&s.to_le_bytes());
                }
                b
            }
            Seeds::U32(v) => {
                let mut b = Vec::with_capacity(v.len() * 4);
                for s in v {
                    b.extend_from_slice(&s.to_le_bytes());
                }
                b
            }
        };
        w.write_all(&body)?;
        Ok(body.len())
    }
}

fn next_pow2(n: u64) -> u64 {
    n.max(1).next_power_of_two()
}
