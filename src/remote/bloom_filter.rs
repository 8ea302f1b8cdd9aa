//! Probabilistic membership test sent by the server with existence filters.
//!
//! Each value is hashed once with SHA-256; the first 16 bytes give two
//! little-endian `u64` seeds and bit `i` of `hash_count` is
//! `(h1 + i * h2) mod bit_count`, with wrapping 64-bit arithmetic.

use sha2::{Digest, Sha256};

use crate::error::{invalid_argument, SyncResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    padding: u8,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    /// Validates a decoded payload. Every ambiguous combination is rejected
    /// so the caller can fall back to a full requery.
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> SyncResult<Self> {
        if !(0..=7).contains(&padding) {
            return Err(invalid_argument(format!("Invalid bloom filter padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(invalid_argument(format!(
                "Invalid bloom filter hash count: {hash_count}"
            )));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(invalid_argument(format!(
                "Empty bloom filter with non-zero padding: {padding}"
            )));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument("Bloom filter with bits but zero hash count"));
        }
        let bit_count = bitmap.len() as u64 * 8 - padding as u64;
        Ok(Self {
            bitmap,
            padding: padding as u8,
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    /// An all-zero filter sized for `bit_count` bits.
    pub fn with_bit_count(bit_count: u64, hash_count: u32) -> Self {
        let bytes = bit_count.div_ceil(8);
        let padding = (bytes * 8 - bit_count) as u8;
        Self {
            bitmap: vec![0; bytes as usize],
            padding,
            hash_count,
            bit_count,
        }
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    pub fn padding(&self) -> u8 {
        self.padding
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    fn seeds(value: &str) -> (u64, u64) {
        let digest = Sha256::digest(value.as_bytes());
        let mut first = [0u8; 8];
        let mut second = [0u8; 8];
        first.copy_from_slice(&digest[0..8]);
        second.copy_from_slice(&digest[8..16]);
        (u64::from_le_bytes(first), u64::from_le_bytes(second))
    }

    fn bit_indexes(&self, value: &str) -> impl Iterator<Item = u64> {
        let (h1, h2) = Self::seeds(value);
        let bit_count = self.bit_count;
        (0..self.hash_count as u64)
            .map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % bit_count)
    }

    fn is_bit_set(&self, index: u64) -> bool {
        self.bitmap[(index / 8) as usize] & (1 << (index % 8)) != 0
    }

    /// `false` means `value` was definitely never inserted.
    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        self.bit_indexes(value).all(|index| self.is_bit_set(index))
    }

    pub fn insert(&mut self, value: &str) {
        if self.bit_count == 0 {
            return;
        }
        let indexes: Vec<u64> = self.bit_indexes(value).collect();
        for index in indexes {
            self.bitmap[(index / 8) as usize] |= 1 << (index % 8);
        }
    }
}
