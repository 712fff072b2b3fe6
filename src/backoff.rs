//! Backoff strategies for the retry harness

use std::time::Duration;

/// Backoff strategy for retries
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Fixed delay between retries
    Constant { delay: Duration },
    /// `base · multiplier^(attempt-1)`, capped at `max`
    Exponential { base: Duration, multiplier: f64, max: Duration },
}

impl Backoff {
    /// Create a constant backoff strategy
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    /// Create an exponential backoff strategy
    pub fn exponential(base: Duration, multiplier: f64, max: Duration) -> Self {
        Backoff::Exponential { base, multiplier, max }
    }

    /// Calculate the delay for a given attempt number (1-indexed)
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Exponential { base, multiplier, max } => {
                let exponent = attempt.saturating_sub(1) as i32;
                let factor = multiplier.powi(exponent);
                // mul_f64 panics on overflow; saturate through millis instead
                let millis = (base.as_millis() as f64 * factor).min(max.as_millis() as f64);
                Duration::from_millis(millis as u64).min(*max)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_backoff_returns_same_delay() {
        let backoff = Backoff::constant(Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(100), Duration::from_secs(1));
    }

    #[test]
    fn exponential_backoff_multiplies_each_time() {
        let backoff =
            Backoff::exponential(Duration::from_millis(100), 2.0, Duration::from_secs(60));
        assert_eq!(backoff.delay(1), Duration::from_millis(100)); // 100 · 2^0
        assert_eq!(backoff.delay(2), Duration::from_millis(200)); // 100 · 2^1
        assert_eq!(backoff.delay(3), Duration::from_millis(400)); // 100 · 2^2
        assert_eq!(backoff.delay(5), Duration::from_millis(1600));
    }

    #[test]
    fn exponential_backoff_honors_non_integer_multipliers() {
        let backoff =
            Backoff::exponential(Duration::from_millis(100), 1.5, Duration::from_secs(60));
        assert_eq!(backoff.delay(2), Duration::from_millis(150));
        assert_eq!(backoff.delay(3), Duration::from_millis(225));
    }

    #[test]
    fn exponential_backoff_respects_max() {
        let backoff =
            Backoff::exponential(Duration::from_millis(100), 2.0, Duration::from_secs(5));
        assert_eq!(backoff.delay(7), Duration::from_secs(5)); // 6400ms, capped
        assert_eq!(backoff.delay(40), Duration::from_secs(5)); // still capped
    }

    #[test]
    fn exponential_backoff_handles_huge_attempts() {
        let backoff =
            Backoff::exponential(Duration::from_secs(1), 2.0, Duration::from_secs(30));
        // 2^200 overflows every integer type; the cap must still hold
        assert_eq!(backoff.delay(200), Duration::from_secs(30));
    }
}
