//! Bloom filter over the trace ids contained in a block.
//!
//! Soundness contract: a negative answer proves the block does not contain
//! the trace id. False positives only cost an extra row-group probe.

use data_types::TraceId;
use siphasher::sip::SipHasher24;
use std::hash::Hasher;

const MAGIC: u32 = 0x4c42_4c4d; // "LBLM"

/// Bits per expected entry for roughly a 1% false-positive rate at k=7.
const BITS_PER_ENTRY: usize = 10;
const HASH_COUNT: u32 = 7;

/// A fixed-size double-hashing bloom filter.
#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    hash_count: u32,
}

fn hash_pair(trace_id: &TraceId) -> (u64, u64) {
    let mut h1 = SipHasher24::new_with_keys(0x626c_6f6f, 0x6d5f_6831);
    h1.write(trace_id.as_bytes());
    let mut h2 = SipHasher24::new_with_keys(0x626c_6f6f, 0x6d5f_6832);
    h2.write(trace_id.as_bytes());
    // an even h2 could cycle through only half the bit positions
    (h1.finish(), h2.finish() | 1)
}

impl BloomFilter {
    /// Size a filter for `expected_entries` trace ids.
    pub fn with_capacity(expected_entries: usize) -> Self {
        let num_bits = (expected_entries.max(1) * BITS_PER_ENTRY).next_power_of_two() as u64;
        Self {
            bits: vec![0u64; (num_bits as usize) / 64],
            num_bits,
            hash_count: HASH_COUNT,
        }
    }

    /// Record a trace id.
    pub fn insert(&mut self, trace_id: &TraceId) {
        let (h1, h2) = hash_pair(trace_id);
        for i in 0..self.hash_count as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    /// Probe for a trace id. `false` is definitive.
    pub fn contains(&self, trace_id: &TraceId) -> bool {
        let (h1, h2) = hash_pair(trace_id);
        (0..self.hash_count as u64).all(|i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0
        })
    }

    /// Serialize for the `bloom_0` object.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.bits.len() * 8);
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&self.hash_count.to_le_bytes());
        out.extend_from_slice(&self.num_bits.to_le_bytes());
        for word in &self.bits {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Inverse of [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 16 {
            return None;
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        if magic != MAGIC {
            return None;
        }
        let hash_count = u32::from_le_bytes(bytes[4..8].try_into().ok()?);
        let num_bits = u64::from_le_bytes(bytes[8..16].try_into().ok()?);
        let words = bytes[16..]
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().expect("8-byte chunk")))
            .collect::<Vec<_>>();
        if (words.len() as u64) * 64 != num_bits || num_bits == 0 {
            return None;
        }
        Some(Self {
            bits: words,
            num_bits,
            hash_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace_id(n: u64) -> TraceId {
        let mut bytes = [0u8; 16];
        bytes[8..].copy_from_slice(&n.to_be_bytes());
        TraceId::new(bytes)
    }

    #[test]
    fn no_false_negatives() {
        let mut filter = BloomFilter::with_capacity(1_000);
        for n in 1..=1_000 {
            filter.insert(&trace_id(n));
        }
        for n in 1..=1_000 {
            assert!(filter.contains(&trace_id(n)));
        }
    }

    #[test]
    fn false_positive_rate_is_plausible() {
        let mut filter = BloomFilter::with_capacity(10_000);
        for n in 1..=10_000 {
            filter.insert(&trace_id(n));
        }
        let false_positives = (100_000..110_000)
            .filter(|n| filter.contains(&trace_id(*n)))
            .count();
        // generous bound: target rate is ~1%
        assert!(
            false_positives < 500,
            "false positive rate too high: {false_positives}/10000"
        );
    }

    #[test]
    fn serialization_round_trip() {
        let mut filter = BloomFilter::with_capacity(100);
        for n in 1..=100 {
            filter.insert(&trace_id(n));
        }
        let bytes = filter.to_bytes();
        let back = BloomFilter::from_bytes(&bytes).unwrap();
        assert_eq!(filter, back);
    }

    #[test]
    fn rejects_corrupt_bytes() {
        assert!(BloomFilter::from_bytes(&[]).is_none());
        assert!(BloomFilter::from_bytes(&[0u8; 16]).is_none());

        let filter = BloomFilter::with_capacity(10);
        let mut bytes = filter.to_bytes();
        bytes.truncate(bytes.len() - 3);
        assert!(BloomFilter::from_bytes(&bytes).is_none());
    }
}
