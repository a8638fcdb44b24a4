use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Retry and backoff settings shared by job execution and aggregation tasks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Maximum number of attempts before a job is failed.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub backoff_cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_cap_ms: 300_000, // 5 minutes
        }
    }
}

impl RetryPolicy {
    /// Backoff to wait after `attempts` attempts have been made.
    pub fn backoff(&self, attempts: u32) -> Duration {
        compute_backoff(attempts, self)
    }

    /// Decide what happens after attempt number `attempts` failed.
    pub fn decide(&self, attempts: u32, max_attempts: u32) -> RetryDecision {
        if should_fail(attempts, max_attempts) {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry {
                delay: self.backoff(attempts),
            }
        }
    }
}

/// Computes the retry delay using capped exponential backoff.
///
/// Formula: delay = min(base * 2^(attempts-1), cap)
///
/// # Arguments
/// * `attempts` - Number of attempts made so far, including the one that failed
/// * `policy` - The retry policy
pub fn compute_backoff(attempts: u32, policy: &RetryPolicy) -> Duration {
    if attempts == 0 {
        return Duration::milliseconds(0);
    }

    let exp = attempts.saturating_sub(1).min(62) as i32;
    let scaled = (policy.backoff_base_ms as f64) * 2f64.powi(exp);
    let capped = scaled.min(policy.backoff_cap_ms as f64);
    let clamped_ms = capped.max(0.0) as i64;

    Duration::milliseconds(clamped_ms)
}

/// Returns true when no attempts remain.
pub fn should_fail(attempts: u32, max_attempts: u32) -> bool {
    attempts >= max_attempts
}

/// Outcome of a retryable failure.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    /// Schedule another attempt after `delay`.
    Retry { delay: Duration },
    /// Attempts are used up.
    Exhausted,
}
