//! Randomness provider abstraction.
//!
//! The cluster draws randomness in exactly three places: member id
//! generation, gossip peer sampling, and retry jitter. The trait exposes
//! those draws and nothing else, so a seeded test source only has three
//! methods to honor.

use rand::prelude::*;

/// Provider trait for the cluster's random draws.
pub trait RandomProvider: Clone + Send + Sync + 'static {
    /// Uniform random `u64`. Used to mint member ids.
    fn next_u64(&self) -> u64;

    /// Uniform index into a collection of `len` elements.
    ///
    /// Used by the gossiper's partial shuffle when sampling peers.
    ///
    /// # Panics
    ///
    /// Panics when `len` is zero.
    fn pick_index(&self, len: usize) -> usize;

    /// Uniform `f64` in `[0.0, 1.0)`. Used to jitter retry backoff.
    fn jitter(&self) -> f64;
}

/// Production randomness from the thread-local RNG.
#[derive(Clone, Copy, Default)]
pub struct TokioRandomProvider;

impl TokioRandomProvider {
    /// Create a new production random provider.
    pub fn new() -> Self {
        Self
    }
}

impl RandomProvider for TokioRandomProvider {
    fn next_u64(&self) -> u64 {
        rand::rng().random()
    }

    fn pick_index(&self, len: usize) -> usize {
        rand::rng().random_range(0..len)
    }

    fn jitter(&self) -> f64 {
        rand::rng().random()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_index_stays_in_bounds() {
        let random = TokioRandomProvider::new();
        for _ in 0..100 {
            assert!(random.pick_index(5) < 5);
        }
        assert_eq!(random.pick_index(1), 0);
    }

    #[test]
    fn test_jitter_in_unit_interval() {
        let random = TokioRandomProvider::new();
        for _ in 0..100 {
            let j = random.jitter();
            assert!((0.0..1.0).contains(&j));
        }
    }

    #[test]
    fn test_next_u64_varies() {
        let random = TokioRandomProvider::new();
        let draws: std::collections::HashSet<u64> = (0..8).map(|_| random.next_u64()).collect();
        assert!(draws.len() > 1, "eight identical u64 draws");
    }
}
