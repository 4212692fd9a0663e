//! BBHash minimal perfect hashing over 64-bit keys.
//!
//! Each level hashes the surviving keys into a bit vector sized
//! `ceil(n * gamma)`; keys that collide are pushed to the next level. A key
//! is found at the first level whose bit it owns, and its minimal index is
//! that level's cumulative rank plus the in-level rank of the bit.
//!
//! Levels with at least [`MIN_PARALLEL_KEYS`] keys run their two passes
//! sharded across the rayon pool; the shared bit vectors are mutated with
//! word-level atomics, so the only merge step is concatenating the
//! shard-local redo lists at each barrier.

use std::io::Write;

use rayon::prelude::*;

use crate::bitvec::BitVector;
use crate::error::{Error, Result};
use crate::hasher::{bhash, rand_u64};
use crate::mph::{Mph, MphBuilder};

/// Level cap; per the paper every extra level exponentially reduces the
/// probability of needing another one, so running into this means the keys
/// or the salt are pathological.
const MAX_LEVEL: u32 = 4000;

/// Minimum number of keys in a level before its passes are sharded.
pub(crate) const MIN_PARALLEL_KEYS: usize = 20_000;

const BBHASH_HEADER_SIZE: usize = 16;

/// Builder accumulating keys for a [`BbHash`] table.
pub struct BbHashBuilder {
    keys: Vec<u64>,
    gamma: f64,
}

impl BbHashBuilder {
    /// Creates a builder with expansion factor `gamma`.
    ///
    /// Larger values trade table size for fewer levels and a lower chance
    /// of construction failure; 2.0 is a good balance. Values at or below
    /// 1.0 cannot converge and are coerced to 2.0.
    pub fn new(gamma: f64) -> Self {
        BbHashBuilder {
            keys: Vec::with_capacity(1024),
            gamma: if gamma <= 1.0 { 2.0 } else { gamma },
        }
    }

    /// Adds a key.
    pub fn add(&mut self, key: u64) {
        self.keys.push(key);
    }

    /// Consumes the builder and constructs the level stack.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MphFail`] if keys keep colliding past the level cap.
    pub fn freeze(self) -> Result<BbHash> {
        let salt = rand_u64();
        let n = self.keys.len();
        let mut keys = self.keys;
        let mut levels: Vec<BitVector> = Vec::new();
        let mut level: u32 = 0;

        loop {
            let bits = (keys.len() as f64 * self.gamma).ceil() as u64;
            let a = BitVector::new(bits);
            let coll = BitVector::new(bits);

            keys = if keys.len() >= MIN_PARALLEL_KEYS {
                build_level_parallel(&keys, &a, &coll, salt, level)
            } else {
                build_level_serial(&keys, &a, &coll, salt, level)
            };

            levels.push(a);
            level += 1;
            if keys.is_empty() {
                break;
            }
            // Only give up when yet another level would be needed past the
            // cap.
            if level > MAX_LEVEL {
                return Err(Error::MphFail { attempts: level });
            }
        }

        Ok(BbHash {
            ranks: compute_ranks(&levels),
            levels,
            salt,
            n,
        })
    }
}

impl MphBuilder for BbHashBuilder {
    fn add(&mut self, key: u64) -> Result<()> {
        self.keys.push(key);
        Ok(())
    }

    fn freeze(self: Box<Self>) -> Result<Box<dyn Mph>> {
        Ok(Box::new((*self).freeze()?))
    }
}

/// One level: detect collisions, then assign the collision-free keys and
/// collect the rest for the next level.
fn build_level_serial(
    keys: &[u64],
    a: &BitVector,
    coll: &BitVector,
    salt: u64,
    level: u32,
) -> Vec<u64> {
    preprocess(keys, a, coll, salt, level);
    a.reset();
    assign(keys, a, coll, salt, level)
}

/// Same two passes, sharded. `par_chunks` joins all shards before
/// returning, which provides the barrier between the collision pass, the
/// reset, and the assignment pass.
fn build_level_parallel(
    keys: &[u64],
    a: &BitVector,
    coll: &BitVector,
    salt: u64,
    level: u32,
) -> Vec<u64> {
    let shards = rayon::current_num_threads().max(1);
    let chunk = keys.len().div_ceil(shards);

    keys.par_chunks(chunk)
        .for_each(|shard| preprocess(shard, a, coll, salt, level));

    a.reset();

    keys.par_chunks(chunk)
        .map(|shard| assign(shard, a, coll, salt, level))
        .reduce(Vec::new, |mut redo, mut part| {
            redo.append(&mut part);
            redo
        })
}

/// Collision pass: first owner of a bit sets it in `a`; any later arrival
/// moves the bit to `coll`. The atomic test-and-set guarantees exactly one
/// arrival sees the bit clear, even across shards.
fn preprocess(keys: &[u64], a: &BitVector, coll: &BitVector, salt: u64, level: u32) {
    let size = a.size();
    for &k in keys {
        let i = bhash(k, salt, level) % size;
        if coll.test(i) {
            continue;
        }
        if a.test_and_set(i) {
            coll.set(i);
        }
    }
}

/// Assignment pass over the reset `a`: keys on collision-free bits claim
/// them; the rest go on the shard-local redo list.
fn assign(keys: &[u64], a: &BitVector, coll: &BitVector, salt: u64, level: u32) -> Vec<u64> {
    let size = a.size();
    let mut redo = Vec::with_capacity(keys.len() / 4);
    for &k in keys {
        let i = bhash(k, salt, level) % size;
        if coll.test(i) {
            redo.push(k);
        } else {
            a.set(i);
        }
    }
    redo
}

fn compute_ranks(levels: &[BitVector]) -> Vec<u64> {
    let mut ranks = Vec::with_capacity(levels.len());
    let mut pop = 0u64;
    for bv in levels {
        ranks.push(pop);
        pop += bv.compute_rank();
    }
    ranks
}

/// Frozen BBHash table: a minimal perfect hash onto `[0, len())`.
pub struct BbHash {
    levels: Vec<BitVector>,
    ranks: Vec<u64>,
    salt: u64,
    n: usize,
}

impl BbHash {
    /// Reconstructs a table from its marshaled form.
    ///
    /// The buffer may be a view into a memory-mapped file; the level
    /// vectors are copied out and the rank prefix is recomputed, so the
    /// returned value does not borrow from `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TooSmall`], [`Error::BadVersion`] or
    /// [`Error::Corrupted`] when the buffer does not hold a valid table.
    pub fn from_bytes(buf: &[u8]) -> Result<BbHash> {
        if buf.len() < BBHASH_HEADER_SIZE {
            return Err(Error::TooSmall {
                need: BBHASH_HEADER_SIZE,
                have: buf.len(),
            });
        }
        if buf[0] != 1 {
            return Err(Error::BadVersion(buf[0]));
        }
        let nlevels = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let salt = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        if nlevels == 0 || nlevels > MAX_LEVEL {
            return Err(Error::Corrupted(format!(
                "level count {nlevels} out of range (max {MAX_LEVEL})"
            )));
        }

        let mut rest = &buf[BBHASH_HEADER_SIZE..];
        let mut levels = Vec::with_capacity(nlevels as usize);
        for _ in 0..nlevels {
            let (bv, used) = BitVector::from_bytes(rest)?;
            rest = &rest[used..];
            levels.push(bv);
        }

        let ranks = compute_ranks(&levels);
        let n = match ranks.last() {
            Some(&prefix) => (prefix + levels[levels.len() - 1].compute_rank()) as usize,
            None => 0,
        };
        Ok(BbHash {
            levels,
            ranks,
            salt,
            n,
        })
    }
}

impl Mph for BbHash {
    fn find(&self, key: u64) -> Option<u64> {
        for (level, bv) in self.levels.iter().enumerate() {
            let i = bhash(key, self.salt, level as u32) % bv.size();
            if bv.test(i) {
                return Some(self.ranks[level] + bv.rank(i));
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.n
    }

    fn marshal(&self, w: &mut dyn Write) -> std::io::Result<usize> {
        let mut hdr = [0u8; BBHASH_HEADER_SIZE];
        hdr[0] = 1;
        hdr[4..8].copy_from_slice(&(self.levels.len() as u32).to_le_bytes());
        hdr[8..16].copy_from_slice(&self.salt.to_le_bytes());
        w.write_all(&hdr)?;

        let mut n = hdr.len();
        for bv in &self.levels {
            n += bv.marshal(w)?;
        }
        Ok(n)
    }

    fn dump_meta(&self, w: &mut dyn Write) -> std::io::Result<()> {
        writeln!(
            w,
            "  bbhash: {} levels <salt {:#018x}>",
            self.levels.len(),
            self.salt,
        )?;
        for (level, bv) in self.levels.iter().enumerate() {
            writeln!(w, "    {level}: {} bits", bv.size())?;
        }
        Ok(())
    }
}
