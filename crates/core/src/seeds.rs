//! Seed generation for parallel job groups.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Exclusive upper bound of sampler seeds (2^53, the largest integer range a
/// JSON number represents exactly).
pub const SEED_LIMIT: u64 = 1 << 53;

const GOLDEN_RATIO: f64 = 1.618_033_988_749_895;
const GOLDEN_SCALE: f64 = 1_000_000.0;
const GOLDEN_MODULUS: u64 = 1 << 32;

/// How seeds vary across the children of a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedStrategy {
    #[default]
    Random,
    Sequential,
    Fibonacci,
    GoldenRatio,
}

impl SeedStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Sequential => "sequential",
            Self::Fibonacci => "fibonacci",
            Self::GoldenRatio => "golden_ratio",
        }
    }
}

impl fmt::Display for SeedStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeedStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "sequential" => Ok(Self::Sequential),
            "fibonacci" => Ok(Self::Fibonacci),
            "golden_ratio" | "golden" => Ok(Self::GoldenRatio),
            other => Err(CoreError::Validation(format!(
                "Unknown seed strategy \"{other}\""
            ))),
        }
    }
}

/// Generate exactly `count` pairwise distinct seeds in `[0, SEED_LIMIT)`.
///
/// Deterministic strategies start from `base`; a collision (possible after
/// wrapping) is resolved by probing upward until a free seed is found.
pub fn generate_seeds(strategy: SeedStrategy, base: u64, count: usize) -> Vec<u64> {
    let base = base % SEED_LIMIT;
    let mut seen = HashSet::with_capacity(count);
    let mut seeds = Vec::with_capacity(count);

    match strategy {
        SeedStrategy::Random => {
            let mut rng = rand::rng();
            while seeds.len() < count {
                let seed = rng.random_range(0..SEED_LIMIT);
                if seen.insert(seed) {
                    seeds.push(seed);
                }
            }
        }
        SeedStrategy::Sequential => {
            for i in 0..count {
                push_unique(&mut seeds, &mut seen, wrap(base as u128 + i as u128));
            }
        }
        SeedStrategy::Fibonacci => {
            let (mut prev, mut cur): (u128, u128) = (0, 1);
            for _ in 0..count {
                // fib(i + 1): 1, 1, 2, 3, 5, ...
                push_unique(&mut seeds, &mut seen, wrap(base as u128 + cur));
                let next = (prev + cur) % SEED_LIMIT as u128;
                prev = cur;
                cur = next;
            }
        }
        SeedStrategy::GoldenRatio => {
            for i in 0..count {
                let offset = ((i as f64) * GOLDEN_RATIO * GOLDEN_SCALE).floor() as u64;
                let seed = (base.wrapping_add(offset)) % GOLDEN_MODULUS;
                push_unique(&mut seeds, &mut seen, seed);
            }
        }
    }
    seeds
}

fn wrap(value: u128) -> u64 {
    (value % SEED_LIMIT as u128) as u64
}

fn push_unique(seeds: &mut Vec<u64>, seen: &mut HashSet<u64>, mut seed: u64) {
    while !seen.insert(seed) {
        seed = (seed + 1) % SEED_LIMIT;
    }
    seeds.push(seed);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_distinct(seeds: &[u64]) {
        let set: HashSet<&u64> = seeds.iter().collect();
        assert_eq!(set.len(), seeds.len(), "duplicate seeds in {seeds:?}");
    }

    #[test]
    fn sequential_counts_up_from_base() {
        assert_eq!(generate_seeds(SeedStrategy::Sequential, 100, 3), vec![100, 101, 102]);
    }

    #[test]
    fn fibonacci_dedups_leading_ones() {
        let seeds = generate_seeds(SeedStrategy::Fibonacci, 10, 5);
        // 10+1, 10+1 (taken -> 12), 10+2 (taken -> 13), 10+3 (taken -> 14), 10+5
        assert_eq!(seeds, vec![11, 12, 13, 14, 15]);
    }

    #[test]
    fn every_strategy_yields_n_distinct_seeds() {
        for strategy in [
            SeedStrategy::Random,
            SeedStrategy::Sequential,
            SeedStrategy::Fibonacci,
            SeedStrategy::GoldenRatio,
        ] {
            for n in [0usize, 1, 2, 16, 64] {
                let seeds = generate_seeds(strategy, 42, n);
                assert_eq!(seeds.len(), n, "{strategy}");
                assert_distinct(&seeds);
                assert!(seeds.iter().all(|s| *s < SEED_LIMIT));
            }
        }
    }

    #[test]
    fn golden_ratio_stays_in_32_bits() {
        let seeds = generate_seeds(SeedStrategy::GoldenRatio, u32::MAX as u64, 8);
        assert!(seeds.iter().all(|s| *s < GOLDEN_MODULUS));
        assert_eq!(seeds[1], (u32::MAX as u64 + 1_618_033) % GOLDEN_MODULUS);
    }

    #[test]
    fn sequential_wraps_at_limit() {
        let seeds = generate_seeds(SeedStrategy::Sequential, SEED_LIMIT - 1, 2);
        assert_eq!(seeds, vec![SEED_LIMIT - 1, 0]);
    }

    #[test]
    fn parses_strategy_names() {
        assert_eq!("Sequential".parse::<SeedStrategy>().unwrap(), SeedStrategy::Sequential);
        assert_eq!("golden_ratio".parse::<SeedStrategy>().unwrap(), SeedStrategy::GoldenRatio);
        assert!("chaotic".parse::<SeedStrategy>().is_err());
    }
}
