//! Small shared helpers: retry backoff and jitter.

use std::time::Duration;

use rand::Rng;

/// Apply ±25% jitter to a millisecond delay.
pub fn jitter_ms(base_ms: u64) -> u64 {
    let spread = (base_ms / 4).max(1);
    let low = base_ms.saturating_sub(spread);
    let high = base_ms + spread;
    rand::thread_rng().gen_range(low..=high)
}

/// Exponential backoff delay for a retry attempt (0-based), with ±25%
/// jitter, capped.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt));
    let capped = exp.min(cap);
    Duration::from_millis(jitter_ms(capped.as_millis() as u64))
}

/// A poll interval spread over ±20% so idle workers do not thunder in step.
pub fn jittered_interval(base: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let spread = (base_ms / 5).max(1);
    let low = base_ms.saturating_sub(spread);
    let high = base_ms + spread;
    Duration::from_millis(rand::thread_rng().gen_range(low..=high))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let jittered = jitter_ms(1000);
            assert!((750..=1250).contains(&jittered));
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(30);
        // Attempt 0 stays near the base, attempt 10 near the cap; jitter is
        // at most 25% either way.
        let first = backoff_delay(0, base, cap);
        assert!(first <= Duration::from_millis(6250));
        let late = backoff_delay(10, base, cap);
        assert!(late >= Duration::from_millis(22500));
        assert!(late <= Duration::from_millis(37500));
    }

    #[test]
    fn test_jittered_interval_bounds() {
        for _ in 0..100 {
            let d = jittered_interval(Duration::from_millis(5000));
            assert!(d >= Duration::from_millis(4000));
            assert!(d <= Duration::from_millis(6000));
        }
    }
}
