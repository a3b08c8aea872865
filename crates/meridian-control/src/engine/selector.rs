//! Randomised ordering of candidate work items.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Shuffles candidate lists so concurrent workers spread over the backlog
/// instead of all contending for the head of it.
#[derive(Debug)]
pub struct WorkItemSelector {
    rng: Mutex<StdRng>,
}

impl WorkItemSelector {
    /// Selector seeded from the operating system.
    #[must_use]
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Selector with a fixed seed. The same seed yields the same orders.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    #[must_use]
    pub fn from_seed(seed: Option<u64>) -> Self {
        seed.map_or_else(Self::from_entropy, Self::seeded)
    }

    /// Shuffle `items` in place.
    pub fn shuffle<T>(&self, items: &mut [T]) {
        items.shuffle(&mut *self.rng.lock());
    }
}

impl Default for WorkItemSelector {
    fn default() -> Self {
        Self::from_entropy()
    }
}
