//! Deterministic utilities for reproducible training
//!
//! Provides a seeded LCG, word hashing, and the race-aware holdout split so
//! that the same data and seed always produce the same models.

use crate::frame::Frame;
use std::num::Wrapping;

/// 64-bit Linear Congruential Generator (Knuth MMIX constants).
/// Outputs are taken from the high bits, which have the longest period.
#[derive(Clone, Debug)]
pub struct LcgRng {
    state: Wrapping<u64>,
}

impl LcgRng {
    const MULTIPLIER: u64 = 6364136223846793005;
    const INCREMENT: u64 = 1442695040888963407;

    pub fn new(seed: u64) -> Self {
        let mut rng = Self {
            state: Wrapping(seed ^ 0x5DEE_CE66_D1CE_4E5D),
        };
        // discard the first output, which is close to the seed
        rng.next_u32();
        rng
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state = self.state * Wrapping(Self::MULTIPLIER) + Wrapping(Self::INCREMENT);
        (self.state.0 >> 32) as u32
    }

    pub fn next_u64(&mut self) -> u64 {
        ((self.next_u32() as u64) << 32) | self.next_u32() as u64
    }

    /// Uniform value in `[0, 1)`
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform integer in `[0, max)`; 0 when `max == 0`
    pub fn next_range(&mut self, max: usize) -> usize {
        if max == 0 {
            return 0;
        }
        ((self.next_u32() as u64 * max as u64) >> 32) as usize
    }

    /// Fisher-Yates shuffle
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.next_range(i + 1);
            items.swap(i, j);
        }
    }

    /// `k` distinct indices from `0..n`, in ascending order
    pub fn sample_indices(&mut self, n: usize, k: usize) -> Vec<usize> {
        let mut all: Vec<usize> = (0..n).collect();
        self.shuffle(&mut all);
        all.truncate(k.min(n));
        all.sort_unstable();
        all
    }
}

/// Deterministic xxhash64-style mix over 64-bit words
pub fn hash_words(data: &[u64], seed: u64) -> u64 {
    const PRIME1: u64 = 0x9E3779B185EBCA87;
    const PRIME2: u64 = 0xC2B2AE3D27D4EB4F;
    const PRIME3: u64 = 0x165667B19E3779F9;
    const PRIME5: u64 = 0x85EBCA77C2B2AE63;

    let mut h = seed.wrapping_add(PRIME5);

    for &val in data {
        h = h.wrapping_add(val.wrapping_mul(PRIME3));
        h = h.rotate_left(17).wrapping_mul(PRIME2);
    }

    h ^= h >> 33;
    h = h.wrapping_mul(PRIME1);
    h ^= h >> 29;
    h = h.wrapping_mul(PRIME2);
    h ^= h >> 32;

    h
}

/// Row indices reserved for fitting and for held-out evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldoutSplit {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
}

/// Split rows into train and validation sets.
///
/// When every race-key column is present, whole races land on the same side so
/// entrants of one race never straddle the split. Otherwise rows are assigned
/// individually. Assignment depends only on the key values and the seed.
pub fn holdout_split(frame: &Frame, race_key: &[String], fraction: f64, seed: u64) -> HoldoutSplit {
    let key_columns = if race_key.is_empty() {
        None
    } else {
        frame.columns_for(race_key).ok()
    };

    let mut train = Vec::new();
    let mut validation = Vec::new();

    for row in 0..frame.n_rows() {
        let hash = match &key_columns {
            Some(cols) => {
                let words: Vec<u64> = cols.iter().map(|c| c[row].to_bits()).collect();
                hash_words(&words, seed)
            }
            None => hash_words(&[row as u64], seed),
        };
        let unit = (hash >> 11) as f64 / (1u64 << 53) as f64;
        if unit < fraction {
            validation.push(row);
        } else {
            train.push(row);
        }
    }

    HoldoutSplit { train, validation }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lcg_determinism() {
        let mut rng1 = LcgRng::new(42);
        let mut rng2 = LcgRng::new(42);

        for _ in 0..100 {
            assert_eq!(rng1.next_u64(), rng2.next_u64());
        }
    }

    #[test]
    fn test_lcg_range() {
        let mut rng = LcgRng::new(42);
        for _ in 0..1000 {
            assert!(rng.next_range(10) < 10);
            let u = rng.next_f64();
            assert!((0.0..1.0).contains(&u));
        }
        assert_eq!(rng.next_range(0), 0);
    }

    #[test]
    fn test_shuffle_is_permutation() {
        let mut rng = LcgRng::new(7);
        let mut items: Vec<usize> = (0..50).collect();
        rng.shuffle(&mut items);
        let mut sorted = items.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
        assert_ne!(items, sorted);
    }

    #[test]
    fn test_hash_different_seeds() {
        let data = vec![1, 2, 3, 4, 5];
        assert_eq!(hash_words(&data, 42), hash_words(&data, 42));
        assert_ne!(hash_words(&data, 42), hash_words(&data, 43));
    }

    #[test]
    fn test_holdout_keeps_races_together() {
        let n = 600;
        let race: Vec<f64> = (0..n).map(|i| (i / 6) as f64).collect();
        let frame = Frame::from_columns(vec![("race_id", race.clone())]).unwrap();
        let split = holdout_split(&frame, &["race_id".to_string()], 0.2, 42);

        assert_eq!(split.train.len() + split.validation.len(), n);
        assert!(!split.validation.is_empty());
        for &v in &split.validation {
            assert!(split.train.iter().all(|&t| race[t] != race[v]));
        }
    }

    #[test]
    fn test_holdout_is_deterministic() {
        let frame = Frame::from_columns(vec![("x", vec![0.0; 100])]).unwrap();
        let a = holdout_split(&frame, &[], 0.3, 1);
        let b = holdout_split(&frame, &[], 0.3, 1);
        assert_eq!(a, b);
        assert!(!a.validation.is_empty() && !a.train.is_empty());
    }
}
