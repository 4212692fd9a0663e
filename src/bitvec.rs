//! Bit vector with population-count rank, backed by atomic 64-bit words.
//!
//! Mutation goes through `fetch_or`/relaxed stores so the BBHash level
//! passes can hammer a shared vector from several shards without extra
//! locking; the word-level read-modify-write is all the synchronization the
//! algorithm needs. Once [`BitVector::compute_rank`] has been called the
//! vector is treated as read-only.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// Fixed-size bit vector; the size is always rounded up to a multiple of 64.
pub(crate) struct BitVector {
    words: Vec<AtomicU64>,
}

impl BitVector {
    /// Creates a vector holding at least `bits` bits (minimum one word).
    pub(crate) fn new(bits: u64) -> Self {
        let words = bits.div_ceil(64).max(1);
        BitVector {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Number of bits; always a multiple of 64.
    #[inline]
    pub(crate) fn size(&self) -> u64 {
        self.words.len() as u64 * 64
    }

    /// Number of backing 64-bit words.
    #[inline]
    pub(crate) fn words(&self) -> u64 {
        self.words.len() as u64
    }

    /// Sets bit `i`.
    #[inline]
    pub(crate) fn set(&self, i: u64) {
        self.words[(i / 64) as usize].fetch_or(1 << (i % 64), Ordering::Relaxed);
    }

    /// Returns whether bit `i` is set.
    #[inline]
    pub(crate) fn test(&self, i: u64) -> bool {
        self.words[(i / 64) as usize].load(Ordering::Relaxed) >> (i % 64) & 1 == 1
    }

    /// Sets bit `i` and returns its previous state in one atomic step.
    ///
    /// Concurrent callers racing on the same bit are guaranteed that exactly
    /// one of them observes `false`.
    #[inline]
    pub(crate) fn test_and_set(&self, i: u64) -> bool {
        let mask = 1 << (i % 64);
        self.words[(i / 64) as usize].fetch_or(mask, Ordering::Relaxed) & mask != 0
    }

    /// Clears every bit. Only called at synchronization points, never while
    /// another thread mutates the vector.
    pub(crate) fn reset(&self) {
        for w in &self.words {
            w.store(0, Ordering::Relaxed);
        }
    }

    /// ORs `other` into `self`. Both vectors must be the same size.
    pub(crate) fn merge(&self, other: &BitVector) {
        debug_assert_eq!(self.words.len(), other.words.len());
        for (w, o) in self.words.iter().zip(&other.words) {
            let z = o.load(Ordering::Relaxed);
            if z != 0 {
                w.fetch_or(z, Ordering::Relaxed);
            }
        }
    }

    /// Total population count. Call once when construction of the vector is
    /// complete; afterwards the vector must not be mutated.
    pub(crate) fn compute_rank(&self) -> u64 {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as u64)
            .sum()
    }

    /// Number of set bits at positions strictly below `i`.
    pub(crate) fn rank(&self, i: u64) -> u64 {
        let x = (i / 64) as usize;
        let y = i % 64;

        let mut r: u64 = 0;
        for w in &self.words[..x] {
            r += w.load(Ordering::Relaxed).count_ones() as u64;
        }
        let w = self.words[x].load(Ordering::Relaxed);
        r + (w & ((1 << y) - 1)).count_ones() as u64
    }

    /// Writes the vector in its portable form: little-endian word count,
    /// then the words themselves little-endian. Returns the bytes written.
    pub(crate) fn marshal(&self, w: &mut dyn Write) -> std::io::Result<usize> {
        let mut buf = Vec::with_capacity(8 + self.words.len() * 8);
        buf.extend_from_slice(&self.words().to_le_bytes());
        for word in &self.words {
            buf.extend_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
        }
        w.write_all(&buf)?;
        Ok(buf.len())
    }

    /// Reconstructs a vector from its portable form, returning it together
    /// with the number of bytes consumed.
    pub(crate) fn from_bytes(buf: &[u8]) -> Result<(BitVector, usize)> {
        if buf.len() < 8 {
            return Err(Error::TooSmall {
                need: 8,
                have: buf.len(),
            });
        }
        let nwords = u64::from_le_bytes(buf[..8].try_into().unwrap());
        if nwords == 0 || nwords > 1 << 32 {
            return Err(Error::Corrupted(format!(
                "bit vector of {nwords} words is out of range"
            )));
        }
        let need = 8 + nwords as usize * 8;
        if buf.len() < need {
            return Err(Error::TooSmall {
                need,
                have: buf.len(),
            });
        }
        let words = buf[8..need]
            .chunks_exact(8)
            .map(|c| AtomicU64::new(u64::from_le_bytes(c.try_into().unwrap())))
            .collect();
        Ok((BitVector { words }, need))
    }
}

impl std::fmt::Debug for BitVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitVector")
            .field("bits", &self.size())
            .field("ones", &self.compute_rank())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_test_reset() {
        let bv = BitVector::new(200);
        assert_eq!(bv.size(), 256);
        assert_eq!(bv.words(), 4);

        for i in [0u64, 1, 63, 64, 65, 127, 128, 199, 255] {
            assert!(!bv.test(i));
            bv.set(i);
            assert!(bv.test(i));
        }
        assert_eq!(bv.compute_rank(), 9);

        bv.reset();
        for i in 0..bv.size() {
            assert!(!bv.test(i));
        }
        assert_eq!(bv.compute_rank(), 0);
    }

    #[test]
    fn test_zero_bits_still_one_word() {
        let bv = BitVector::new(0);
        assert_eq!(bv.size(), 64);
        assert_eq!(bv.words(), 1);
    }

    #[test]
    fn test_test_and_set() {
        let bv = BitVector::new(64);
        assert!(!bv.test_and_set(17));
        assert!(bv.test_and_set(17));
        assert!(bv.test(17));
        assert!(!bv.test_and_set(18));
    }

    #[test]
    fn test_merge() {
        let a = BitVector::new(128);
        let b = BitVector::new(128);
        a.set(3);
        a.set(100);
        b.set(100);
        b.set(101);
        a.merge(&b);
        assert!(a.test(3) && a.test(100) && a.test(101));
        assert_eq!(a.compute_rank(), 3);
        // merge must not write back into its argument
        assert!(!b.test(3));
    }

    #[test]
    fn test_rank() {
        let bv = BitVector::new(256);
        let ones = [0u64, 1, 63, 64, 127, 200];
        for &i in &ones {
            bv.set(i);
        }

        assert_eq!(bv.rank(0), 0);
        assert_eq!(bv.rank(1), 1);
        assert_eq!(bv.rank(2), 2);
        assert_eq!(bv.rank(63), 2);
        assert_eq!(bv.rank(64), 3);
        assert_eq!(bv.rank(65), 4);
        assert_eq!(bv.rank(128), 5);
        assert_eq!(bv.rank(200), 5);
        assert_eq!(bv.rank(201), 6);

        // rank of the i-th set bit equals i
        for (n, &i) in ones.iter().enumerate() {
            assert_eq!(bv.rank(i), n as u64);
        }
    }

    #[test]
    fn test_marshal_roundtrip() {
        let bv = BitVector::new(300);
        for i in [0u64, 7, 64, 255, 299] {
            bv.set(i);
        }

        let mut buf = Vec::new();
        let n = bv.marshal(&mut buf).unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(n, 8 + bv.words() as usize * 8);

        let (got, used) = BitVector::from_bytes(&buf).unwrap();
        assert_eq!(used, n);
        assert_eq!(got.size(), bv.size());
        for i in 0..bv.size() {
            assert_eq!(got.test(i), bv.test(i));
        }
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(matches!(
            BitVector::from_bytes(&[1, 2, 3]),
            Err(Error::TooSmall { .. })
        ));

        let zero = 0u64.to_le_bytes();
        assert!(matches!(
            BitVector::from_bytes(&zero),
            Err(Error::Corrupted(_))
        ));

        let mut truncated = Vec::new();
        truncated.extend_from_slice(&4u64.to_le_bytes());
        truncated.extend_from_slice(&[0u8; 16]); // promises 4 words, holds 2
        assert!(matches!(
            BitVector::from_bytes(&truncated),
            Err(Error::TooSmall { need: 40, have: 24 })
        ));
    }
}
