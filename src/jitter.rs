//! Jitter strategies to prevent thundering herd

use rand::Rng;
use std::time::Duration;

/// Jitter added on top of the computed backoff delay.
#[derive(Debug, Clone)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    None,
    /// Add a uniform random duration in `[0, max]`
    Uniform { max: Duration },
}

impl Jitter {
    /// Create a uniform jitter strategy
    pub fn uniform(max: Duration) -> Self {
        Jitter::Uniform { max }
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Uniform { max } => {
                let max_millis = max.as_millis() as u64;
                if max_millis == 0 {
                    return delay;
                }
                delay + Duration::from_millis(rng.random_range(0..=max_millis))
            }
        }
    }
}
