//! Per-partition bloom filter used to admission-control background
//! fetches for keys that provably do not exist on disk (spec.md §4.1).
//!
//! Hand-rolled rather than pulled from a crate: the filter must be
//! rebuildable and atomically swappable at the end of a compaction pass,
//! which the teacher's own cache modules model with a plain `Vec<u64>`
//! bitset rather than an external dependency.

use std::sync::atomic::{AtomicU64, Ordering};

/// A counting-free, swappable Bloom filter over `&[u8]` keys.
pub struct BloomFilter {
    bits: Vec<AtomicU64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sizes a filter for `expected_items` entries at `false_positive_rate`.
    /// Both `num_bits` and `num_hashes` follow the standard optimal-bloom
    /// formulas: `m = -n*ln(p) / ln(2)^2`, `k = (m/n)*ln(2)`.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(1e-6, 0.5);
        let m = (-n * p.ln() / std::f64::consts::LN_2.powi(2)).ceil().max(64.0);
        let k = ((m / n) * std::f64::consts::LN_2).round().clamp(1.0, 16.0) as u32;
        let num_bits = m as u64;
        let words = (num_bits as usize).div_ceil(64).max(1);
        Self {
            bits: (0..words).map(|_| AtomicU64::new(0)).collect(),
            num_bits,
            num_hashes: k,
        }
    }

    fn hash_pair(&self, key: &[u8]) -> (u64, u64) {
        use std::hash::{Hash, Hasher};
        let mut h1 = ahash::AHasher::default();
        key.hash(&mut h1);
        let a = h1.finish();
        let mut h2 = ahash::AHasher::default();
        (key, 0x9E3779B97F4A7C15u64).hash(&mut h2);
        let b = h2.finish();
        (a, b | 1)
    }

    fn bit_indices<'a>(&'a self, key: &[u8]) -> impl Iterator<Item = u64> + 'a {
        let (a, b) = self.hash_pair(key);
        let num_bits = self.num_bits;
        (0..self.num_hashes).map(move |i| (a.wrapping_add((i as u64).wrapping_mul(b))) % num_bits)
    }

    /// Adds a key to the filter.
    pub fn insert(&self, key: &[u8]) {
        for idx in self.bit_indices(key) {
            let word = (idx / 64) as usize;
            let bit = 1u64 << (idx % 64);
            self.bits[word].fetch_or(bit, Ordering::Relaxed);
        }
    }

    /// Returns `false` if `key` is definitely absent; `true` if it may be
    /// present (a false positive is possible, a false negative is not).
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.bit_indices(key).all(|idx| {
            let word = (idx / 64) as usize;
            let bit = 1u64 << (idx % 64);
            self.bits[word].load(Ordering::Relaxed) & bit != 0
        })
    }

    /// Clears every bit, e.g. before a full rebuild during compaction.
    pub fn clear(&self) {
        for w in &self.bits {
            w.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_keys_are_always_reported_present() {
        let bf = BloomFilter::new(1000, 0.01);
        for i in 0..500u32 {
            bf.insert(&i.to_le_bytes());
        }
        for i in 0..500u32 {
            assert!(bf.may_contain(&i.to_le_bytes()));
        }
    }

    #[test]
    fn empty_filter_rejects_everything() {
        let bf = BloomFilter::new(100, 0.01);
        assert!(!bf.may_contain(b"anything"));
    }

    #[test]
    fn false_positive_rate_is_roughly_bounded() {
        let bf = BloomFilter::new(2000, 0.01);
        for i in 0..2000u32 {
            bf.insert(&i.to_le_bytes());
        }
        let mut false_positives = 0;
        let probes = 5000u32;
        for i in 2000..(2000 + probes) {
            if bf.may_contain(&i.to_le_bytes()) {
                false_positives += 1;
            }
        }
        let rate = false_positives as f64 / probes as f64;
        assert!(rate < 0.1, "observed fp rate {rate} too high");
    }

    #[test]
    fn clear_resets_membership() {
        let bf = BloomFilter::new(100, 0.01);
        bf.insert(b"k");
        assert!(bf.may_contain(b"k"));
        bf.clear();
        assert!(!bf.may_contain(b"k"));
    }
}
