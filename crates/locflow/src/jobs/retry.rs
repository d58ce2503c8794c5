use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_seconds: i64,
    pub max_seconds: i64,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_seconds: 1,
            max_seconds: 15 * 60,
            jitter_pct: 0.20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

/// Error codes emitted by the stage handlers. Malformed payloads and
/// unroutable jobs cannot succeed on a re-run; everything else (provider
/// outages, delivery failures, db hiccups, timeouts) is worth retrying.
pub fn classify_error(code: &str) -> ErrorClass {
    match code {
        "BAD_PAYLOAD" | "UNKNOWN_QUEUE" => ErrorClass::NonRetryable,
        _ => ErrorClass::Retryable,
    }
}

/// Exponential backoff with a cap and symmetric jitter.
/// attempt_no=1 -> base, attempt_no=2 -> 2*base, doubling up to max_seconds.
pub fn next_delay_seconds(attempt_no: i32, cfg: &RetryConfig, rng: &mut impl Rng) -> i64 {
    let exp = (attempt_no.max(1) as u32).saturating_sub(1);
    let pow2 = 1_i64.checked_shl(exp).unwrap_or(i64::MAX);
    let delay = cfg.base_seconds.saturating_mul(pow2).min(cfg.max_seconds);

    let jitter_range = (delay as f64) * cfg.jitter_pct;
    let jitter = if jitter_range > 0.0 {
        rng.gen_range(-jitter_range..=jitter_range)
    } else {
        0.0
    };

    ((delay as f64 + jitter).round() as i64).clamp(0, cfg.max_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            base_seconds: 1,
            max_seconds: 64,
            jitter_pct: 0.0,
        }
    }

    #[test]
    fn delays_double_per_attempt_without_jitter() {
        let cfg = no_jitter();
        let mut rng = StdRng::seed_from_u64(0);
        let delays: Vec<i64> = (1..=5)
            .map(|n| next_delay_seconds(n, &cfg, &mut rng))
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn delay_is_capped_at_max_seconds() {
        let cfg = no_jitter();
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(next_delay_seconds(30, &cfg, &mut rng), 64);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let cfg = RetryConfig {
            base_seconds: 10,
            max_seconds: 1000,
            jitter_pct: 0.5,
        };
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let d = next_delay_seconds(3, &cfg, &mut rng);
            // nominal 40s, +/- 50%
            assert!((20..=60).contains(&d), "delay {d} out of jitter bounds");
        }
    }

    #[test]
    fn payload_errors_are_not_retried() {
        assert_eq!(classify_error("BAD_PAYLOAD"), ErrorClass::NonRetryable);
        assert_eq!(classify_error("UNKNOWN_QUEUE"), ErrorClass::NonRetryable);
        assert_eq!(classify_error("PROVIDER"), ErrorClass::Retryable);
        assert_eq!(classify_error("DELIVERY"), ErrorClass::Retryable);
        assert_eq!(classify_error("SOMETHING_NEW"), ErrorClass::Retryable);
    }
}
