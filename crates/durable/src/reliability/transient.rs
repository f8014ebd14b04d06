//! Bounded retry for transient backend failures
//!
//! Store and queue calls that fail with a transient error are retried here
//! with exponential backoff before the error is surfaced to the caller.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::serde_millis;

/// Errors that know whether they are worth retrying
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Backoff settings for transient retries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransientRetryConfig {
    /// Total attempts including the first call
    pub max_attempts: u32,

    #[serde(with = "serde_millis")]
    pub initial_backoff: Duration,

    #[serde(with = "serde_millis")]
    pub max_backoff: Duration,

    pub multiplier: f64,
}

impl Default for TransientRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl TransientRetryConfig {
    /// Fail fast: one attempt only
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    fn backoff(&self, retry: u32) -> Duration {
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(retry as i32);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }
}

/// Run `op`, retrying transient failures
pub async fn retry_transient<T, E, F, Fut>(
    config: &TransientRetryConfig,
    operation: &str,
    mut op: F,
) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < config.max_attempts => {
                let delay = config.backoff(attempt - 1);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum FakeError {
        Flaky,
        Broken,
    }

    impl std::fmt::Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl Transient for FakeError {
        fn is_transient(&self) -> bool {
            matches!(self, FakeError::Flaky)
        }
    }

    fn fast() -> TransientRetryConfig {
        TransientRetryConfig::default().with_initial_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<u32, FakeError> = retry_transient(&fast(), "op", move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(FakeError::Flaky)
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), FakeError> = retry_transient(&fast(), "op", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(FakeError::Flaky)
        })
        .await;

        assert!(matches!(result, Err(FakeError::Flaky)));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), FakeError> = retry_transient(&fast(), "op", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(FakeError::Broken)
        })
        .await;

        assert!(matches!(result, Err(FakeError::Broken)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
