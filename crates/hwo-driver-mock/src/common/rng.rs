//! Seeded RNG wrapper for reproducible behavior.
//!
//! Mock transports draw failure decisions and value jitter from this, so a
//! seeded transport replays the same sequence on every run.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Thread-safe, optionally seeded random source.
pub struct MockRng {
    inner: Mutex<ChaCha8Rng>,
}

impl MockRng {
    /// Create a new RNG. `None` seeds from the OS.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            inner: Mutex::new(rng),
        }
    }

    /// `true` with probability `rate` (clamped to 0.0..=1.0).
    pub fn should_fail(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.inner.lock().r#gen::<f64>() < rate
    }

    /// Uniform value in `[0.0, 1.0)`.
    pub fn next_f64(&self) -> f64 {
        self.inner.lock().r#gen()
    }

    /// Multiply `value` by a random factor in `1 ± fraction`.
    pub fn jitter(&self, value: f64, fraction: f64) -> f64 {
        if fraction <= 0.0 {
            return value;
        }
        let factor = 1.0 + fraction * (2.0 * self.next_f64() - 1.0);
        value * factor
    }
}

impl Default for MockRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for MockRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRng")
            .field("inner", &"<Mutex<ChaCha8Rng>>")
            .finish()
    }
}
