// src/retry.rs
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Per-item attempt accounting for generation and publish.
/// - Backoff doubles per failed attempt, capped at `max_backoff_secs`.
/// - `max_attempts = None` keeps retrying forever.
/// - `base_backoff_secs = 0` disables the cooldown window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_base")]
    pub base_backoff_secs: u64,
    #[serde(default = "default_max")]
    pub max_backoff_secs: u64,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_base() -> u64 {
    60
}
fn default_max() -> u64 {
    6 * 3600
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff_secs: default_base(),
            max_backoff_secs: default_max(),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// No cooldown, no cap.
    pub fn immediate() -> Self {
        Self {
            base_backoff_secs: 0,
            max_backoff_secs: 0,
            max_attempts: None,
        }
    }

    /// Cooldown after `attempts` failures (attempts >= 1).
    pub fn backoff(&self, attempts: u32) -> ChronoDuration {
        if self.base_backoff_secs == 0 || attempts == 0 {
            return ChronoDuration::zero();
        }
        let shift = (attempts - 1).min(20);
        let secs = self
            .base_backoff_secs
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_secs.max(self.base_backoff_secs));
        ChronoDuration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
    }

    pub fn next_attempt_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.backoff(attempts)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            base_backoff_secs: 60,
            max_backoff_secs: 300,
            max_attempts: None,
        };
        assert_eq!(p.backoff(1), ChronoDuration::seconds(60));
        assert_eq!(p.backoff(2), ChronoDuration::seconds(120));
        assert_eq!(p.backoff(3), ChronoDuration::seconds(240));
        assert_eq!(p.backoff(4), ChronoDuration::seconds(300));
        assert_eq!(p.backoff(40), ChronoDuration::seconds(300));
    }

    #[test]
    fn immediate_policy_never_waits_or_gives_up() {
        let p = RetryPolicy::immediate();
        assert_eq!(p.backoff(7), ChronoDuration::zero());
        assert!(!p.exhausted(1_000));
    }

    #[test]
    fn max_attempts_marks_exhaustion() {
        let p = RetryPolicy {
            max_attempts: Some(3),
            ..RetryPolicy::default()
        };
        assert!(!p.exhausted(2));
        assert!(p.exhausted(3));
    }
}
