//! Retry policy - 有界重试与退避
//!
//! An explicit retry component: the caller supplies the operation, a
//! predicate over its error kinds, and a hook invoked before every retry.

use crate::stop::StopToken;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded retry with optional multiplicative backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    pub delay: Duration,

    /// Multiplier applied per further attempt (1.0 = fixed)
    pub backoff_factor: f64,

    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
            backoff_factor: 1.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Passed to the retry hook before sleeping.
#[derive(Debug)]
pub struct RetryAttempt<'a, E> {
    /// The attempt that just failed, starting at 1
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub error: &'a E,
}

/// Successful end of the retry loop.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    Completed { value: T, attempts: u32 },
    /// Stop was requested between attempts
    Aborted { attempts: u32 },
}

/// The last error of a failed retry loop.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every allowed attempt failed with a retryable error
    Exhausted { attempts: u32, source: E },
    /// The error kind is not retryable
    NotRetryable { attempts: u32, source: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::NotRetryable { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn source_error(&self) -> &E {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::NotRetryable { source, .. } => source,
        }
    }

    pub fn into_source(self) -> E {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::NotRetryable { source, .. } => source,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, source } => {
                write!(f, "{} (after {} attempts)", source, attempts)
            }
            RetryError::NotRetryable { attempts, source } => {
                write!(f, "{} (not retryable, attempt {})", source, attempts)
            }
        }
    }
}

impl<E> std::error::Error for RetryError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source_error())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, factor: f64) -> Self {
        self.backoff_factor = if factor.is_finite() && factor >= 1.0 {
            factor
        } else {
            1.0
        };
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs
    /// out of attempts, or `stop` fires between attempts.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, Op, Fut, P, H>(
        &self,
        stop: &StopToken,
        mut op: Op,
        is_retryable: P,
        mut on_retry: H,
    ) -> Result<RetryOutcome<T>, RetryError<E>>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        H: FnMut(&RetryAttempt<'_, E>),
        E: fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if stop.is_stopped() {
                return Ok(RetryOutcome::Aborted { attempts: attempt });
            }
            attempt += 1;

            let error = match op(attempt).await {
                Ok(value) => {
                    return Ok(RetryOutcome::Completed {
                        value,
                        attempts: attempt,
                    });
                }
                Err(error) => error,
            };

            if !is_retryable(&error) {
                return Err(RetryError::NotRetryable {
                    attempts: attempt,
                    source: error,
                });
            }
            if attempt >= max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    source: error,
                });
            }

            let delay = self.delay_for(attempt);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, retrying"
            );
            on_retry(&RetryAttempt {
                attempt,
                max_attempts,
                delay,
                error: &error,
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.stopped() => {
                    return Ok(RetryOutcome::Aborted { attempts: attempt });
                }
            }
        }
    }
}
