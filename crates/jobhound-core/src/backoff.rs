use std::time::Duration;

use rand::Rng;

/// `min(base * 2^(attempt - 1), cap)`. Attempt numbers start at 1.
pub fn exponential(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    base.saturating_mul(2_u32.saturating_pow(exp)).min(cap)
}

/// Scales `delay` by a random factor in `[0.75, 1.25]`.
pub fn with_jitter(delay: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.75..=1.25);
    delay.mul_f64(factor)
}

pub fn backoff_with_jitter(base: Duration, cap: Duration, attempt: u32) -> Duration {
    with_jitter(exponential(base, cap, attempt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let base = Duration::from_secs(30);
        let cap = Duration::from_secs(300);
        let delays: Vec<u64> = (1..=6)
            .map(|attempt| exponential(base, cap, attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![30, 60, 120, 240, 300, 300]);
    }

    #[test]
    fn attempt_zero_behaves_like_first() {
        let base = Duration::from_millis(500);
        assert_eq!(
            exponential(base, Duration::from_secs(10), 0),
            exponential(base, Duration::from_secs(10), 1)
        );
    }

    #[test]
    fn jitter_stays_in_band() {
        let delay = Duration::from_secs(100);
        for _ in 0..200 {
            let jittered = with_jitter(delay);
            assert!(jittered >= Duration::from_secs(75));
            assert!(jittered <= Duration::from_secs(125));
        }
    }

    #[test]
    fn jittered_doubling_strictly_grows_below_cap() {
        let base = Duration::from_secs(10);
        let cap = Duration::from_secs(10_000);
        for attempt in 1..8 {
            let current = backoff_with_jitter(base, cap, attempt);
            let next = backoff_with_jitter(base, cap, attempt + 1);
            assert!(next > current, "attempt {attempt}: {next:?} <= {current:?}");
        }
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let cap = Duration::from_secs(3600);
        assert_eq!(exponential(Duration::from_secs(30), cap, u32::MAX), cap);
    }
}
