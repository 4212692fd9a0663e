//! Hash primitives shared by the CHD and BBHash constructions and by the
//! record integrity checks.
//!
//! `bhash` and `rhash` are rounds of Zi Long Tan's fasthash; their output is
//! part of the on-disk contract, so the constants and operation order here
//! must never change. A database written on one host has to probe
//! identically on every other.

use std::hash::Hasher;

use rand::rngs::OsRng;
use rand::RngCore;
use siphasher::sip::SipHasher24;

const M: u64 = 0x880355f21e6d1965;

/// fasthash compression function.
#[inline]
pub(crate) fn mix64(mut x: u64) -> u64 {
    x ^= x >> 23;
    x = x.wrapping_mul(0x2127599bf4325c37);
    x ^ (x >> 47)
}

/// Level hash used by BBHash: one fasthash round over (key, salt, level).
#[inline]
pub(crate) fn bhash(key: u64, salt: u64, level: u32) -> u64 {
    let mut h = M;
    h ^= mix64(key);
    h = h.wrapping_mul(M);
    h ^= mix64(salt);
    h = h.wrapping_mul(M);
    h ^= mix64(level as u64);
    h = h.wrapping_mul(M);
    mix64(h)
}

/// Seeded slot hash used by CHD, reduced modulo `size`.
///
/// `size` must be a power of two; the mask below stands in for the modulo.
#[inline]
pub(crate) fn rhash(seed: u32, key: u64, size: u64, salt: u64) -> u64 {
    let mut h = key;
    h = h.wrapping_mul(M);
    h ^= mix64(salt);
    h = h.wrapping_mul(M);
    h ^= mix64(seed as u64);
    h = h.wrapping_mul(M);
    mix64(h) & (size - 1)
}

/// Integrity checksum of one value record: SipHash-2-4 keyed with the
/// 16-byte file salt over the big-endian record offset followed by the
/// value bytes.
pub(crate) fn record_checksum(salt: &[u8; 16], offset: u64, value: &[u8]) -> u64 {
    let mut h = SipHasher24::new_with_key(salt);
    h.write(&offset.to_be_bytes());
    h.write(value);
    h.finish()
}

// Salt generation draws from the OS entropy source directly. Running out of
// entropy here is the one condition the crate is allowed to die on.

pub(crate) fn rand_u64() -> u64 {
    OsRng.next_u64()
}

pub(crate) fn rand_u32() -> u32 {
    OsRng.next_u32()
}

pub(crate) fn rand_salt() -> [u8; 16] {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mix64() {
        assert_eq!(mix64(0), 0);
        assert_eq!(mix64(1), mix64(1));
        assert_ne!(mix64(1), mix64(2));
        // high bits must influence low bits
        assert_ne!(mix64(1 << 63) & 0xffff, 0);
    }

    #[test]
    fn test_rhash_stays_in_range() {
        let salt = rand_u64();
        for shift in [0u32, 1, 5, 16] {
            let size = 1u64 << shift;
            for k in 0..1000u64 {
                assert!(rhash(0, k, size, salt) < size);
                assert!(rhash(7, k, size, salt) < size);
            }
        }
    }

    #[test]
    fn test_bhash_varies_by_level() {
        let salt = rand_u64();
        let key = rand_u64();
        assert_eq!(bhash(key, salt, 3), bhash(key, salt, 3));
        assert_ne!(bhash(key, salt, 0), bhash(key, salt, 1));
        assert_ne!(bhash(key, salt, 0), bhash(key, salt.wrapping_add(1), 0));
    }

    #[test]
    fn test_record_checksum() {
        let salt = rand_salt();
        let c = record_checksum(&salt, 64, b"value");
        assert_eq!(c, record_checksum(&salt, 64, b"value"));
        assert_ne!(c, record_checksum(&salt, 72, b"value"));
        assert_ne!(c, record_checksum(&salt, 64, b"velue"));
        assert_ne!(c, record_checksum(&rand_salt(), 64, b"value"));
    }
}
