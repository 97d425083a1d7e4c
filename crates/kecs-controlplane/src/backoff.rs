//! Retry delays

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with ±25% jitter
///
/// `attempt` is zero-based. The delay before jitter is capped at `max_delay`.
pub fn calculate_backoff(
    attempt: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
) -> Duration {
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let base_delay = initial_delay.as_millis() as f64 * multiplier.max(1.0).powi(exponent);
    let capped_delay = base_delay.min(max_delay.as_millis() as f64);

    let jitter = rand::thread_rng().gen_range(-0.25..=0.25) * capped_delay;
    let final_delay = (capped_delay + jitter).max(0.0);

    Duration::from_millis(final_delay as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_within_jitter() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_secs(10);

        for attempt in 0..5 {
            let expected = 100.0 * 2f64.powi(attempt as i32);
            let delay = calculate_backoff(attempt, initial, max, 2.0).as_millis() as f64;
            assert!(delay >= expected * 0.75 - 1.0, "attempt {}: {}", attempt, delay);
            assert!(delay <= expected * 1.25 + 1.0, "attempt {}: {}", attempt, delay);
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let delay = calculate_backoff(
            40,
            Duration::from_millis(100),
            Duration::from_secs(10),
            2.0,
        );
        assert!(delay <= Duration::from_millis(12_500));
        assert!(delay >= Duration::from_millis(7_500));
    }
}
