// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry with exponential backoff for connection establishment.
//!
//! Only connects go through here. Individual score calls are never retried:
//! a failed call counts against the circuit breaker and the fallback cache
//! answers it immediately.
//!
//! # Example
//!
//! ```
//! use trending_engine::RetryConfig;
//! use std::time::Duration;
//!
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_attempts, 5);
//! assert!(startup.delay_for(10) <= startup.max_delay);
//! assert_eq!(startup.delay_for(1), Duration::from_millis(400));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

/// Backoff schedule for a bounded number of attempts.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts including the first one
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::startup()
    }
}

impl RetryConfig {
    /// Fast-fail schedule for connecting at startup: 5 attempts over a few
    /// seconds, so a wrong URL is reported instead of hanging the process.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Minimal delays for tests
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Delay before retry number `retry` (0-based), capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(retry as i32);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// Run `operation` until it succeeds or `max_attempts` is exhausted,
/// returning the last error.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: usize = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempt > 0 {
                    info!(operation = operation_name, retries = attempt, "Operation succeeded after retry");
                }
                return Ok(val);
            }
            Err(err) => {
                attempt += 1;
                if attempt >= config.max_attempts {
                    warn!(operation = operation_name, attempts = attempt, error = %err, "Giving up");
                    return Err(err);
                }

                let delay = config.delay_for(attempt as u32 - 1);
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = config.max_attempts,
                    error = %err,
                    "Operation failed, retrying in {:?}",
                    delay
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_delay_schedule_is_capped() {
        let config = RetryConfig::startup();
        assert_eq!(config.delay_for(0), Duration::from_millis(200));
        assert_eq!(config.delay_for(2), Duration::from_millis(800));
        assert_eq!(config.delay_for(8), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);

        let result: Result<&str, String> = retry("flaky", &RetryConfig::test(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 { Err(format!("attempt {n} failed")) } else { Ok("connected") }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "connected");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_returns_last_error_when_exhausted() {
        let calls = AtomicUsize::new(0);

        let result: Result<(), String> = retry("down", &RetryConfig::test(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("refused #{n}")) }
        })
        .await;

        assert_eq!(result.unwrap_err(), "refused #2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
