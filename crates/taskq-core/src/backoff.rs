//! Exponential retry backoff, deterministic and capped.

const MAX_DELAY_SECS: i64 = 3600;

/// Delay before the `n`th retry (1-indexed): `base * 2^(n-1)`, capped at
/// `MAX_DELAY_SECS`. No jitter -- see DESIGN.md's Open Question decisions.
pub fn backoff_secs(attempt: u32, base_secs: i64) -> i64 {
    let exponent = attempt.saturating_sub(1);
    let multiplier = 1i64.checked_shl(exponent).unwrap_or(i64::MAX);
    base_secs.saturating_mul(multiplier).min(MAX_DELAY_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_retry_uses_base_delay() {
        assert_eq!(backoff_secs(1, 5), 5);
    }

    #[test]
    fn doubles_each_attempt() {
        assert_eq!(backoff_secs(2, 5), 10);
        assert_eq!(backoff_secs(3, 5), 20);
        assert_eq!(backoff_secs(4, 5), 40);
    }

    #[test]
    fn caps_at_one_hour() {
        assert_eq!(backoff_secs(20, 5), MAX_DELAY_SECS);
    }

    #[test]
    fn handles_large_attempt_without_overflow() {
        let delay = backoff_secs(1000, 5);
        assert_eq!(delay, MAX_DELAY_SECS);
    }
}
