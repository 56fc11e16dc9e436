//! Retrying query executor
//!
//! Every storage operation goes through [`RetryingExecutor::execute`]. The
//! operation runs once; a failure classified Retriable is replayed up to
//! `max_attempts` more times on an escalating schedule (1s, 3s, 5s, 5s...).
//! NonRetriable failures are returned immediately.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::classifier::{Classify, ErrorClass};

/// Storage retry schedule
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StorageRetryConfig {
    /// Retries after the first attempt
    pub max_attempts: u32,
    /// Delay before each retry, by retry index; the last value repeats
    pub schedule_ms: Vec<u64>,
}

impl Default for StorageRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            schedule_ms: vec![1_000, 3_000, 5_000],
        }
    }
}

impl StorageRetryConfig {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let idx = (attempt as usize).min(self.schedule_ms.len().saturating_sub(1));
        Duration::from_millis(self.schedule_ms.get(idx).copied().unwrap_or(0))
    }
}

/// Replays storage operations against the classifier's verdict
#[derive(Debug, Clone, Default)]
pub struct RetryingExecutor {
    config: StorageRetryConfig,
}

impl RetryingExecutor {
    pub fn new(config: StorageRetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StorageRetryConfig {
        &self.config
    }

    /// Run `operation`, retrying transient failures.
    ///
    /// Returns the first success, the first non-retriable error, or the last
    /// error once the attempt budget is spent.
    pub async fn execute<F, Fut, T, E>(&self, name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::fmt::Display,
    {
        let mut result = operation().await;
        let mut attempt = 0;

        while let Err(err) = &result {
            if err.classify() != ErrorClass::Retriable {
                debug!(operation = name, error = %err, "Storage error is not retriable");
                break;
            }
            if attempt >= self.config.max_attempts {
                warn!(
                    operation = name,
                    attempts = attempt + 1,
                    error = %err,
                    "Storage operation failed after retries"
                );
                break;
            }

            let delay = self.config.delay_for(attempt);
            warn!(
                operation = name,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient storage error, retrying"
            );
            sleep(delay).await;

            attempt += 1;
            result = operation().await;
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::classifier::testing::pg_error;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn fast_executor() -> RetryingExecutor {
        RetryingExecutor::new(StorageRetryConfig {
            max_attempts: 3,
            schedule_ms: vec![1, 3, 5],
        })
    }

    #[test]
    fn test_default_schedule() {
        let config = StorageRetryConfig::default();
        assert_eq!(config.delay_for(0), Duration::from_secs(1));
        assert_eq!(config.delay_for(1), Duration::from_secs(3));
        assert_eq!(config.delay_for(2), Duration::from_secs(5));
        assert_eq!(config.delay_for(7), Duration::from_secs(5));
    }

    #[test]
    fn test_empty_schedule_means_no_delay() {
        let config = StorageRetryConfig {
            max_attempts: 2,
            schedule_ms: vec![],
        };
        assert_eq!(config.delay_for(0), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_success_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = fast_executor()
            .execute("ok", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, sqlx::Error>(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retriable_error_recovers() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = fast_executor()
            .execute("flaky", || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(pg_error("40001"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retriable_error_exhausts_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = fast_executor()
            .execute("down", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(pg_error("08006"))
                }
            })
            .await;

        assert!(result.is_err());
        // initial attempt + 3 retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_unique_violation_returns_immediately() {
        // Default schedule: any retry would sleep at least 1s
        let executor = RetryingExecutor::default();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let started = Instant::now();

        let result = executor
            .execute("insert_order", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(pg_error("23505"))
                }
            })
            .await;

        assert!(crate::db::classifier::is_unique_violation(&result.unwrap_err()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
