//! Exponential backoff shared by the dispatcher and the evaluation workers

use rand::Rng;
use std::time::Duration;

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
/// capped at `max_ms`, plus up to 25% random jitter
pub fn backoff_delay(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(32);
    let delay_ms = base_ms.saturating_mul(1u64 << shift).min(max_ms.max(base_ms));
    let jitter_ms = if delay_ms >= 4 {
        rand::thread_rng().gen_range(0..=delay_ms / 4)
    } else {
        0
    };
    Duration::from_millis(delay_ms.saturating_add(jitter_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_within_jitter() {
        for (attempt, expected) in [(1, 100), (2, 200), (3, 400), (4, 800)] {
            let delay = backoff_delay(100, 10_000, attempt).as_millis() as u64;
            assert!(delay >= expected && delay <= expected + expected / 4);
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let delay = backoff_delay(1000, 5000, 30).as_millis() as u64;
        assert!((5000..=6250).contains(&delay));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let delay = backoff_delay(u64::MAX / 2, u64::MAX, u32::MAX);
        assert!(delay.as_millis() > 0);
    }
}
