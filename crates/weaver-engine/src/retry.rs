use std::time::Duration;

use weaver_core::definition::RetryPolicy;

/// Whether a node that just failed `attempt` (1-based) gets another run.
pub fn should_retry(policy: Option<&RetryPolicy>, attempt: u32) -> bool {
    policy.is_some_and(|p| attempt < p.max_attempts)
}

/// Delay before the run following failed `attempt` (1-based): exponential
/// from `initial_backoff_ms`, capped at `max_backoff_ms`, with 0.8x to 1.2x jitter.
pub fn backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let ms = policy
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(exponent))
        .min(policy.max_backoff_ms);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 5_000,
        }
    }

    #[test]
    fn retry_budget() {
        let p = policy();
        assert!(should_retry(Some(&p), 1));
        assert!(should_retry(Some(&p), 2));
        assert!(!should_retry(Some(&p), 3));
        assert!(!should_retry(None, 1));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = policy();
        let first = backoff(&p, 1).as_millis();
        assert!((800..=1200).contains(&first), "{}", first);
        let second = backoff(&p, 2).as_millis();
        assert!((1600..=2400).contains(&second), "{}", second);
        let capped = backoff(&p, 10).as_millis();
        assert!((4000..=6000).contains(&capped), "{}", capped);
    }
}
