//! Sharded bloom filters for fast existence checks
//!
//! Each block stores its IDs in `bloom_shard_count` independent filters so a
//! lookup only fetches the one shard an ID hashes to.

use crate::config::MAX_BLOOM_SHARDS;
use crate::{Result, SpanError};
use bytes::{Buf, BufMut};

const SECOND_HASH_SEED: u32 = 0x9747_b28c;

/// Shard holding `id` when a block has `shard_count` shards
pub fn shard_for(id: &[u8], shard_count: u16) -> u16 {
    (crc32fast::hash(id) % shard_count.max(1) as u32) as u16
}

/// Bloom filter with stable hashing, safe to persist
#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: usize,
    num_hashes: u32,
}

impl BloomFilter {
    /// Create a filter with `num_bits` bits (rounded up to whole bytes)
    pub fn new(num_bits: usize, num_hashes: u32) -> Self {
        let num_bytes = num_bits.max(8).div_ceil(8);
        Self {
            bits: vec![0u8; num_bytes],
            num_bits: num_bytes * 8,
            num_hashes: num_hashes.clamp(1, 30),
        }
    }

    /// Decode a filter written by [`BloomFilter::to_bytes`]
    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        if data.len() < 5 {
            return Err(SpanError::InvalidFormat("Bloom filter too short".into()));
        }
        let num_hashes = data.get_u32_le();
        Ok(Self {
            bits: data.to_vec(),
            num_bits: data.len() * 8,
            num_hashes,
        })
    }

    /// Encode as `num_hashes` (u32 LE) followed by the bit array
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.bits.len());
        buf.put_u32_le(self.num_hashes);
        buf.put_slice(&self.bits);
        buf
    }

    /// Add a key to the filter
    pub fn add(&mut self, key: &[u8]) {
        let (h1, h2) = Self::hash_key(key);
        for i in 0..self.num_hashes {
            let bit = self.bit_position(h1, h2, i);
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
    }

    /// Check if a key may be in the set
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::hash_key(key);
        (0..self.num_hashes).all(|i| {
            let bit = self.bit_position(h1, h2, i);
            self.bits[bit / 8] & (1 << (bit % 8)) != 0
        })
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Estimated false positive rate
    pub fn false_positive_rate(&self, num_keys: usize) -> f64 {
        let k = self.num_hashes as f64;
        let m = self.num_bits as f64;
        let n = num_keys as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    fn hash_key(key: &[u8]) -> (u64, u64) {
        let h1 = crc32fast::hash(key) as u64;
        let mut hasher = crc32fast::Hasher::new_with_initial(SECOND_HASH_SEED);
        hasher.update(key);
        // odd step so every bit is reachable
        let h2 = (hasher.finalize() as u64) | 1;
        (h1, h2)
    }

    fn bit_position(&self, h1: u64, h2: u64, i: u32) -> usize {
        (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits as u64) as usize
    }
}

/// A block's set of bloom shards
#[derive(Debug, Clone)]
pub struct ShardedBloomFilter {
    shards: Vec<BloomFilter>,
}

impl ShardedBloomFilter {
    /// Size shards for `estimated_objects` keys at false positive rate `fp`,
    /// keeping each shard near `shard_size_bytes`
    pub fn new(fp: f64, shard_size_bytes: usize, estimated_objects: usize) -> Self {
        let n = estimated_objects.max(1) as f64;
        let fp = fp.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;

        let total_bits = (-n * fp.ln() / (ln2 * ln2)).ceil() as usize;
        let shard_count = (total_bits / 8)
            .div_ceil(shard_size_bytes.max(1))
            .clamp(1, MAX_BLOOM_SHARDS);
        let bits_per_shard = total_bits.div_ceil(shard_count);
        let keys_per_shard = n / shard_count as f64;
        let num_hashes = ((bits_per_shard as f64 / keys_per_shard) * ln2).round() as u32;

        Self {
            shards: (0..shard_count)
                .map(|_| BloomFilter::new(bits_per_shard, num_hashes))
                .collect(),
        }
    }

    pub fn add(&mut self, id: &[u8]) {
        let shard = shard_for(id, self.shard_count());
        self.shards[shard as usize].add(id);
    }

    pub fn may_contain(&self, id: &[u8]) -> bool {
        let shard = shard_for(id, self.shard_count());
        self.shards[shard as usize].may_contain(id)
    }

    pub fn shard_count(&self) -> u16 {
        self.shards.len() as u16
    }

    /// Serialized shards, indexed by shard number
    pub fn marshal(&self) -> Vec<Vec<u8>> {
        self.shards.iter().map(BloomFilter::to_bytes).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bloom_filter() {
        let mut bloom = BloomFilter::new(10_000, 7);
        for i in 0..1000u32 {
            bloom.add(&i.to_be_bytes());
        }
        for i in 0..1000u32 {
            assert!(bloom.may_contain(&i.to_be_bytes()));
        }

        let false_positives = (1000..11_000u32)
            .filter(|i| bloom.may_contain(&i.to_be_bytes()))
            .count();
        assert!(false_positives < 500, "too many false positives: {}", false_positives);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let mut bloom = BloomFilter::new(512, 3);
        bloom.add(b"trace-1");
        let decoded = BloomFilter::from_bytes(&bloom.to_bytes()).unwrap();
        assert_eq!(decoded, bloom);
        assert!(decoded.may_contain(b"trace-1"));
        assert!(BloomFilter::from_bytes(&[1, 0]).is_err());
    }

    #[test]
    fn test_shard_sizing() {
        // 1M ids at 1% need ~1.2MB of bits, split into 100KB shards
        let sharded = ShardedBloomFilter::new(0.01, 100_000, 1_000_000);
        assert_eq!(sharded.shard_count(), 12);

        let small = ShardedBloomFilter::new(0.01, 100_000, 10);
        assert_eq!(small.shard_count(), 1);

        let capped = ShardedBloomFilter::new(0.01, 1, 1_000_000);
        assert_eq!(capped.shard_count() as usize, MAX_BLOOM_SHARDS);
    }

    #[test]
    fn test_sharded_membership() {
        let mut sharded = ShardedBloomFilter::new(0.01, 64, 1000);
        assert!(sharded.shard_count() > 1);
        let ids: Vec<[u8; 16]> = (0..1000u128).map(|i| i.to_be_bytes()).collect();
        for id in &ids {
            sharded.add(id);
        }

        let shards: Vec<BloomFilter> = sharded
            .marshal()
            .iter()
            .map(|b| BloomFilter::from_bytes(b).unwrap())
            .collect();
        for id in &ids {
            let shard = shard_for(id, sharded.shard_count());
            assert!(shards[shard as usize].may_contain(id));
        }
    }
}
