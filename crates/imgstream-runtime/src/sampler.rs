use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use imgstream_core::types::SampleIndex;

/// Uniform random sampling with replacement over `[0, total)`.
#[derive(Debug, Clone)]
pub struct IndexSampler {
    rng: StdRng,
}

impl IndexSampler {
    pub fn from_os_rng() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draws `count` independent indices. Duplicates are allowed within and across calls.
    pub fn sample(&mut self, total: u64, count: usize) -> Vec<SampleIndex> {
        if total == 0 || count == 0 {
            return Vec::new();
        }
        (0..count)
            .map(|_| self.rng.random_range(0..total))
            .collect()
    }
}
