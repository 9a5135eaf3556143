//! Retry backoff (spec.md §4.7): `min(10s * 2^(n-1), 10min)`, escalating
//! after `MAX_NETWORK_RETRIES` consecutive retries.

use std::time::Duration;

const BASE: Duration = Duration::from_secs(10);
const CAP: Duration = Duration::from_secs(600);

/// Consecutive `retry` signals after which the workflow escalates to
/// `error` instead of being retried again (spec.md §4.7).
pub const MAX_NETWORK_RETRIES: u32 = 5;

/// Delay before the `attempt`-th retry (1-based: the first retry is
/// attempt 1, delayed by `BASE`; attempt 0 delays not at all).
pub fn delay_for_attempt(attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let scaled = BASE.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
    Duration::from_secs_f64(scaled.min(CAP.as_secs_f64()))
}

/// Whether `consecutive_failures` should escalate to `error` instead of
/// scheduling another retry.
pub fn should_escalate(consecutive_failures: u32) -> bool {
    consecutive_failures >= MAX_NETWORK_RETRIES
}
