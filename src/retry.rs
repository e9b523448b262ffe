//! Bounded retry with exponential backoff for transient store failures

use crate::config::RetryConfig;
use crate::error::{LeadError, Result};
use std::time::Duration;

/// Retry budget for one logical transition
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_delay: Duration::from_millis(cfg.initial_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): initial * 2^(attempt-1)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out.
    ///
    /// `op` receives the 1-based attempt number. Only errors for which
    /// [`LeadError::is_transient`] holds are retried.
    pub fn run<T, F>(&self, context: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        let attempts = self.max_attempts.max(1);
        for attempt in 1..=attempts {
            match op(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(context, attempt, "transaction committed after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        context,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "store busy, retrying"
                    );
                    std::thread::sleep(delay);
                }
                Err(e) if e.is_transient() => {
                    tracing::error!(context, attempts, error = %e, "retries exhausted");
                    return Err(LeadError::Unavailable { attempts });
                }
                Err(e) => return Err(e),
            }
        }
        Err(LeadError::Unavailable { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::result::{DatabaseErrorKind, Error as DieselError};

    fn locked() -> LeadError {
        LeadError::Store(DieselError::DatabaseError(
            DatabaseErrorKind::Unknown,
            Box::new("database is locked".to_string()),
        ))
    }

    fn instant() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let mut calls = 0;
        let result = instant().run("test", |_| {
            calls += 1;
            if calls < 3 {
                Err(locked())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_exhaustion_is_unavailable() {
        let mut calls = 0;
        let result: Result<()> = instant().run("test", |_| {
            calls += 1;
            Err(locked())
        });
        assert_eq!(calls, 5);
        assert!(matches!(result, Err(LeadError::Unavailable { attempts: 5 })));
    }

    #[test]
    fn test_permanent_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<()> = instant().run("test", |_| {
            calls += 1;
            Err(LeadError::InvalidState("lead is Pending".into()))
        });
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(LeadError::InvalidState(_))));
    }
}
