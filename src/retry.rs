//! Bounded retry for activity invocations.
//!
//! Retries are driven from workflow code with durable timers between
//! attempts, so the whole retry loop replays deterministically: every
//! attempt and every backoff delay is an ordinary history event.
//!
//! Only transient failures are retried. Activities opt in by returning an
//! error built with [`transient`]; validation and other deterministic
//! failures (including the `unregistered:` marker for unknown activity
//! names) escalate immediately.

use std::time::Duration;

use crate::OrchestrationContext;

/// Marker prefix for errors that are worth retrying.
pub const TRANSIENT_PREFIX: &str = "transient:";

/// Build a transient (retryable) activity error.
pub fn transient(msg: impl AsRef<str>) -> String {
    format!("{TRANSIENT_PREFIX} {}", msg.as_ref())
}

/// Whether an activity error is transient under the marker convention.
pub fn is_transient(error: &str) -> bool {
    error.starts_with(TRANSIENT_PREFIX)
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    None,
    Fixed { delay: Duration },
    Linear { base: Duration, max: Duration },
    Exponential { base: Duration, multiplier: f64, max: Duration },
}

impl BackoffStrategy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { base, max } => (*base * attempt).min(*max),
            BackoffStrategy::Exponential { base, multiplier, max } => {
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                let ms = (base.as_millis() as f64 * factor) as u64;
                Duration::from_millis(ms).min(*max)
            }
        }
    }
}

/// Retry budget for one activity invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. At least 1.
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential {
                base: Duration::from_millis(100),
                multiplier: 2.0,
                max: Duration::from_secs(30),
            },
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn no_backoff(self) -> Self {
        self.with_backoff(BackoffStrategy::None)
    }
}

impl OrchestrationContext {
    /// Invoke an activity under a retry budget. Transient failures are
    /// retried with the policy's backoff; deterministic failures and an
    /// exhausted budget return the last error.
    pub async fn call_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: &RetryPolicy,
    ) -> Result<String, String> {
        let name = name.into();
        let input = input.into();
        let mut attempt = 1u32;
        loop {
            match self.call_activity(name.clone(), input.clone()).await {
                Ok(out) => return Ok(out),
                Err(error) => {
                    if !is_transient(&error) || attempt >= policy.max_attempts {
                        return Err(error);
                    }
                    self.trace_warn(format!(
                        "activity '{name}' attempt {attempt}/{} failed transiently: {error}",
                        policy.max_attempts
                    ));
                    let delay = policy.backoff.delay_for(attempt);
                    if !delay.is_zero() {
                        self.timer(delay.as_millis() as u64).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_three_exponential_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        match policy.backoff {
            BackoffStrategy::Exponential { base, multiplier, max } => {
                assert_eq!(base, Duration::from_millis(100));
                assert!((multiplier - 2.0).abs() < f64::EPSILON);
                assert_eq!(max, Duration::from_secs(30));
            }
            other => panic!("expected exponential backoff, got {other:?}"),
        }
    }

    #[test]
    #[should_panic(expected = "max_attempts must be at least 1")]
    fn zero_attempts_is_rejected() {
        let _ = RetryPolicy::new(0);
    }

    #[test]
    fn exponential_backoff_grows_and_caps() {
        let backoff = BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_millis(350),
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(350));
    }

    #[test]
    fn linear_backoff_caps_at_max() {
        let backoff = BackoffStrategy::Linear {
            base: Duration::from_millis(500),
            max: Duration::from_secs(1),
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(500));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(5), Duration::from_secs(1));
    }

    #[test]
    fn transient_marker_roundtrip() {
        let e = transient("provider endpoint timed out");
        assert!(is_transient(&e));
        assert!(!is_transient("not found: provider xyz"));
        assert!(!is_transient("unregistered:ProviderGet"));
    }
}
