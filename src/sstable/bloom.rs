//! Bloom filter for SSTable point-lookup pre-filtering.
//!
//! Sized at build time for the table's key count with a 1% target false
//! positive rate (~9.6 bits per key, 7 hash probes).  Probes are derived
//! from a single 32-bit base hash via rotate-add double hashing, so only
//! one hash of the key is ever computed.
//!
//! The on-disk shape is the raw bit array plus its geometry
//! (`bit count | hash count | bits`), written with varints by
//! [`BloomFilter::encode_to`].

use crate::encoding::{self, EncodingError};

/// Bits per key for a ~1% false positive rate.
const BITS_PER_KEY: f64 = 9.6;

/// Number of hash probes per key.
const HASH_COUNT: u32 = 7;

/// Probabilistic set answering "possibly contains key".
///
/// Never reports false negatives: every inserted key tests positive.
#[derive(Debug)]
pub struct BloomFilter {
    /// Raw bit array, least-significant bit first within each byte.
    bits: Vec<u8>,

    /// Number of usable bits (a multiple of 8 here, but decoded filters
    /// may carry any count their writer chose).
    bit_count: u64,

    /// Number of probes per key.
    hash_count: u32,
}

impl BloomFilter {
    /// Creates an empty filter sized for `entries` keys.
    pub fn for_entries(entries: usize) -> Self {
        let bit_count = ((entries.max(1) as f64 * BITS_PER_KEY).ceil() as u64).max(64);
        let bit_count = bit_count.next_multiple_of(8);
        Self {
            bits: vec![0u8; (bit_count / 8) as usize],
            bit_count,
            hash_count: HASH_COUNT,
        }
    }

    /// Adds `key` to the set.
    pub fn insert(&mut self, key: &[u8]) {
        let mut h = farmhash::fingerprint32(key);
        let delta = h.rotate_left(15);
        for _ in 0..self.hash_count {
            let pos = u64::from(h) % self.bit_count;
            self.bits[(pos / 8) as usize] |= 1 << (pos % 8);
            h = h.wrapping_add(delta);
        }
    }

    /// Returns false only when `key` is definitely absent.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        let mut h = farmhash::fingerprint32(key);
        let delta = h.rotate_left(15);
        for _ in 0..self.hash_count {
            let pos = u64::from(h) % self.bit_count;
            if self.bits[(pos / 8) as usize] & (1 << (pos % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }

    /// Appends the on-disk representation:
    /// `bit_count varint | hash_count varint | bits`.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        encoding::put_uvarint(self.bit_count, buf);
        encoding::put_uvarint(u64::from(self.hash_count), buf);
        buf.extend_from_slice(&self.bits);
    }

    /// Decodes a filter from the beginning of `buf`.
    ///
    /// Returns `(filter, bytes_consumed)`.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (bit_count, mut offset) = encoding::read_uvarint(buf)?;
        let (hash_count, n) = encoding::read_uvarint(&buf[offset..])?;
        offset += n;

        if bit_count == 0 || bit_count > encoding::MAX_FIELD_BYTES as u64 * 8 {
            return Err(EncodingError::OutOfRange("bloom bit count"));
        }
        let hash_count = u32::try_from(hash_count)
            .map_err(|_| EncodingError::OutOfRange("bloom hash count"))?;

        let byte_len = (bit_count as usize).div_ceil(8);
        if buf.len() < offset + byte_len {
            return Err(EncodingError::Truncated {
                missing: offset + byte_len - buf.len(),
            });
        }
        let bits = buf[offset..offset + byte_len].to_vec();
        offset += byte_len;

        Ok((
            Self {
                bits,
                bit_count,
                hash_count,
            },
            offset,
        ))
    }

    /// Number of usable bits.
    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }
}
