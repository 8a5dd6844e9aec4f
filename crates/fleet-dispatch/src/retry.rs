//! Retry classification and backoff scheduling.
//!
//! A delivery attempt's outcome is either a [`Outcome::Delivered`], a
//! [`Outcome::Transient`] failure (network error, 5xx, 429) that earns
//! another attempt up to the route's retry budget, or a [`Outcome::Hard`]
//! failure (any other 4xx) that fails the delivery immediately.
//!
//! `max_retries` counts retries, not attempts: a budget of 3 permits
//! attempts 1, 2, and 3 to each schedule another try, so a route that
//! fails on every call makes 4 attempts total before landing on `failed`.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    Transient,
    Hard,
}

/// Classify an adapter result by HTTP status, the way a webhook, email, or
/// chat destination would report failure. `status = None` means a network-
/// level error (timeout, connection refused), which is always transient.
pub fn classify(status: Option<u16>) -> Outcome {
    match status {
        None => Outcome::Transient,
        Some(s) if (200..300).contains(&s) => Outcome::Delivered,
        Some(429) => Outcome::Transient,
        Some(s) if (500..600).contains(&s) => Outcome::Transient,
        Some(_) => Outcome::Hard,
    }
}

/// A route's retry policy: how many retries to allow and the base delay
/// for exponential backoff. Parsed from `routes.retry_policy`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    pub fn from_json(value: Option<&serde_json::Value>) -> Self {
        let default = Self::default();
        let Some(obj) = value.and_then(|v| v.as_object()) else {
            return default;
        };
        Self {
            max_retries: obj
                .get("max_retries")
                .and_then(|v| v.as_u64())
                .map(|v| v as u32)
                .unwrap_or(default.max_retries),
            initial_delay_ms: obj
                .get("initial_delay_ms")
                .and_then(|v| v.as_i64())
                .unwrap_or(default.initial_delay_ms),
        }
    }
}

/// `initial_delay_ms * 2^(attempt_number-1)`.
/// `attempt_number` is the attempt that just failed (1-indexed); the
/// returned delay schedules the next one.
pub fn retry_delay_ms(policy: RetryPolicy, attempt_number: u32) -> i64 {
    let exponent = attempt_number.saturating_sub(1).min(32);
    policy.initial_delay_ms.saturating_mul(1i64 << exponent)
}

/// `now + initial_delay_ms * 2^(attempt_number-1)`.
/// `attempt_number` is the attempt that just failed (1-indexed); the
/// returned timestamp schedules the next one.
pub fn next_retry_at(now: DateTime<Utc>, policy: RetryPolicy, attempt_number: u32) -> DateTime<Utc> {
    now + chrono::Duration::milliseconds(retry_delay_ms(policy, attempt_number))
}

/// Whether a transient failure on `attempt_number` still has retry budget
/// left under `policy`. `attempt_number` is the attempt that just failed.
pub fn should_retry(policy: RetryPolicy, attempt_number: u32) -> bool {
    attempt_number <= policy.max_retries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_success_and_failure_bands() {
        assert_eq!(classify(Some(200)), Outcome::Delivered);
        assert_eq!(classify(Some(429)), Outcome::Transient);
        assert_eq!(classify(Some(503)), Outcome::Transient);
        assert_eq!(classify(Some(404)), Outcome::Hard);
        assert_eq!(classify(None), Outcome::Transient);
    }

    #[test]
    fn backoff_doubles_each_attempt() {
        let now = Utc::now();
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay_ms: 1_000,
        };
        let first = next_retry_at(now, policy, 1);
        let second = next_retry_at(now, policy, 2);
        let third = next_retry_at(now, policy, 3);
        assert_eq!((first - now).num_milliseconds(), 1_000);
        assert_eq!((second - now).num_milliseconds(), 2_000);
        assert_eq!((third - now).num_milliseconds(), 4_000);
    }

    /// A `max_retries = 3` budget retries attempts 1-3 and fails outright
    /// on attempt 4.
    #[test]
    fn retry_budget_of_three_permits_four_total_attempts() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 1_000,
        };
        assert!(should_retry(policy, 1));
        assert!(should_retry(policy, 2));
        assert!(should_retry(policy, 3));
        assert!(!should_retry(policy, 4));
    }

    #[test]
    fn default_policy_matches_documented_defaults() {
        let policy = RetryPolicy::from_json(None);
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_delay_ms, 1_000);
    }

    #[test]
    fn policy_overrides_come_from_json() {
        let json = serde_json::json!({"max_retries": 5, "initial_delay_ms": 500});
        let policy = RetryPolicy::from_json(Some(&json));
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_delay_ms, 500);
    }
}
