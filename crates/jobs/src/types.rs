//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Deterministic job identifier, derived from the job payload.
///
/// Two requests for the same unit of work produce the same id, which is what
/// makes `add_job` idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A stored job: payload plus scheduling metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord<T> {
    pub id: JobId,
    /// Execution attempts so far; incremented before each run.
    pub attempts: u32,
    /// True exactly while a runner holds the job.
    pub active: bool,
    /// Not eligible before this instant.
    pub retry_after: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub data: T,
}

impl<T> JobRecord<T> {
    /// A fresh, never-attempted record.
    pub fn new(id: JobId, data: T) -> Self {
        Self {
            id,
            attempts: 0,
            active: false,
            retry_after: None,
            last_attempt_at: None,
            data,
        }
    }

    /// Queued and past its backoff.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        !self.active && self.retry_after.is_none_or(|at| at <= now)
    }

    /// Claim the record for a new attempt.
    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.attempts = self.attempts.saturating_add(1);
        self.active = true;
        self.last_attempt_at = Some(now);
    }

    /// Release the record and hold it back until `retry_after`.
    pub fn mark_retry(&mut self, retry_after: DateTime<Utc>) {
        self.active = false;
        self.retry_after = Some(retry_after);
    }

    /// Release the record without touching its backoff.
    pub fn mark_queued(&mut self) {
        self.active = false;
    }
}

/// Upper bound on execution attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptLimit {
    Finite(u32),
    /// Retry forever at the capped backoff.
    Unlimited,
}

impl AttemptLimit {
    pub fn is_last_attempt(&self, attempt: u32) -> bool {
        match self {
            AttemptLimit::Finite(max) => attempt >= *max,
            AttemptLimit::Unlimited => false,
        }
    }
}

/// Exponential backoff schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub multiplier: f64,
    /// Explicit delays for the first attempts.
    pub first_backoffs: Vec<Duration>,
    pub max_backoff: Duration,
}

impl BackoffConfig {
    /// Delay after attempt `attempt` (1-indexed) failed.
    ///
    /// Attempts covered by `first_backoffs` use them directly; later attempts
    /// multiply the last explicit delay by `multiplier` once per extra attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let Some(last) = self.first_backoffs.last() else {
            return self.max_backoff;
        };

        let index = (attempt - 1) as usize;
        if let Some(explicit) = self.first_backoffs.get(index) {
            return (*explicit).min(self.max_backoff);
        }

        let extra = attempt as usize - self.first_backoffs.len();
        let exponent = i32::try_from(extra).unwrap_or(i32::MAX);
        let delay_ms = last.as_millis() as f64 * self.multiplier.powi(exponent);
        let max_ms = self.max_backoff.as_millis() as f64;

        if !delay_ms.is_finite() || delay_ms >= max_ms {
            self.max_backoff
        } else {
            Duration::from_millis(delay_ms.max(0.0) as u64)
        }
    }
}

/// Retry policy for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: AttemptLimit,
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    /// Five attempts: 30s, 5m, 50m, then 6h.
    fn default() -> Self {
        Self {
            max_attempts: AttemptLimit::Finite(5),
            backoff: BackoffConfig {
                multiplier: 10.0,
                first_backoffs: vec![Duration::from_secs(30)],
                max_backoff: Duration::from_secs(6 * 60 * 60),
            },
        }
    }
}

impl RetryConfig {
    /// Same schedule as the default, but never gives up.
    pub fn unlimited() -> Self {
        Self {
            max_attempts: AttemptLimit::Unlimited,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: AttemptLimit) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn is_last_attempt(&self, attempt: u32) -> bool {
        self.max_attempts.is_last_attempt(attempt)
    }
}

/// What a job body reports back to the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome<T> {
    /// Done. The record is removed; `follow_up` is stored as a new record.
    Finished { follow_up: Option<T> },
    /// Try again after the backoff.
    Retry,
    /// The body observed cancellation and unwound.
    Cancelled,
}

impl<T> JobOutcome<T> {
    pub fn finished() -> Self {
        JobOutcome::Finished { follow_up: None }
    }

    pub fn finished_with(follow_up: T) -> Self {
        JobOutcome::Finished {
            follow_up: Some(follow_up),
        }
    }
}

/// Per-attempt context handed to a job body.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub cancellation: CancellationToken,
    pub attempt: u32,
    /// The body must turn a failure into a terminal outcome on this attempt.
    pub is_last_attempt: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_backoff_matches_schedule() {
        let backoff = RetryConfig::default().backoff;

        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(30));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(300));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(3000));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_secs(6 * 60 * 60));
        assert_eq!(backoff.delay_for_attempt(40), Duration::from_secs(6 * 60 * 60));
    }

    #[test]
    fn several_first_backoffs_are_used_in_order() {
        let backoff = BackoffConfig {
            multiplier: 2.0,
            first_backoffs: vec![Duration::from_secs(1), Duration::from_secs(5)],
            max_backoff: Duration::from_secs(60),
        };

        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(10));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_secs(20));
    }

    #[test]
    fn attempt_limits() {
        assert!(!AttemptLimit::Finite(5).is_last_attempt(4));
        assert!(AttemptLimit::Finite(5).is_last_attempt(5));
        assert!(!AttemptLimit::Unlimited.is_last_attempt(u32::MAX));
    }

    #[test]
    fn record_lifecycle() {
        let now = Utc::now();
        let mut record = JobRecord::new(JobId::new("a"), ());
        assert!(record.is_eligible(now));

        record.mark_running(now);
        assert_eq!(record.attempts, 1);
        assert!(!record.is_eligible(now));

        record.mark_retry(now + chrono::Duration::seconds(30));
        assert!(!record.is_eligible(now));
        assert!(record.is_eligible(now + chrono::Duration::seconds(30)));
    }

    proptest! {
        #[test]
        fn backoff_is_capped_and_monotonic(
            b0_secs in 1u64..600,
            multiplier in 1.0f64..20.0,
            cap_secs in 600u64..100_000,
            attempt in 1u32..64,
        ) {
            let backoff = BackoffConfig {
                multiplier,
                first_backoffs: vec![Duration::from_secs(b0_secs)],
                max_backoff: Duration::from_secs(cap_secs),
            };
            let delay = backoff.delay_for_attempt(attempt);
            let next = backoff.delay_for_attempt(attempt + 1);

            prop_assert!(delay <= backoff.max_backoff);
            prop_assert!(delay <= next);
        }

        #[test]
        fn backoff_follows_closed_form(b0_secs in 1u64..100, attempt in 1u32..6) {
            let backoff = BackoffConfig {
                multiplier: 10.0,
                first_backoffs: vec![Duration::from_secs(b0_secs)],
                max_backoff: Duration::from_secs(u32::MAX as u64),
            };
            let expected = b0_secs * 10u64.pow(attempt - 1);
            prop_assert_eq!(backoff.delay_for_attempt(attempt), Duration::from_secs(expected));
        }
    }
}
