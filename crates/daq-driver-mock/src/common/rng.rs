//! Seeded RNG wrapper for reproducible behavior.
//!
//! Shared by the lock-in sample generator and the error injection framework.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Thread-safe, optionally seeded random number generator
pub struct MockRng {
    inner: Mutex<ChaCha8Rng>,
}

impl MockRng {
    /// `None` seeds from OS entropy, so runs differ.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = seed.map_or_else(ChaCha8Rng::from_entropy, ChaCha8Rng::seed_from_u64);
        Self {
            inner: Mutex::new(rng),
        }
    }

    /// `true` with probability `rate`; 0 and 1 never draw.
    pub fn should_fail(&self, rate: f64) -> bool {
        rate >= 1.0 || (rate > 0.0 && self.next_f64() < rate)
    }

    /// Uniform value in `[0, 1)`
    pub fn next_f64(&self) -> f64 {
        self.inner.lock().r#gen()
    }

    /// Uniform value in `range`
    pub fn gen_range<T, R>(&self, range: R) -> T
    where
        T: rand::distributions::uniform::SampleUniform,
        R: rand::distributions::uniform::SampleRange<T>,
    {
        self.inner.lock().gen_range(range)
    }
}

impl Default for MockRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for MockRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MockRng(ChaCha8)")
    }
}
