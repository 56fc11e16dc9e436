//! Retryable HTTP transport
//!
//! Wraps a `reqwest::Client` with exponential backoff and jitter. A request is
//! retried on network failures and on 408, 429 and 5xx responses; every other
//! outcome is handed back to the caller as-is.
//!
//! ```text
//! delay(attempt) = min(base_delay * 2^attempt, max_delay) + uniform[0, max_jitter)
//! ```
//!
//! Waiting between attempts observes a [`CancellationToken`]: cancellation
//! aborts the call immediately with [`TransportError::Cancelled`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use reqwest::{Request, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backoff settings for the retryable transport
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (total attempts = max_retries + 1)
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            max_jitter_ms: 100,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Never below the base delay
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms))
    }

    pub fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.max_jitter_ms)
    }

    /// Deterministic part of the delay before retry `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay()
            .saturating_mul(factor)
            .min(self.max_delay())
    }
}

/// Backoff calculator with an injectable jitter source
pub struct Backoff {
    config: RetryConfig,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Backoff {
    /// Jitter seeded from OS entropy
    pub fn new(config: RetryConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Reproducible jitter sequence
    pub fn with_seed(config: RetryConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    pub fn with_rng<R: RngCore + Send + 'static>(config: RetryConfig, rng: R) -> Self {
        Self {
            config,
            rng: Mutex::new(Box::new(rng)),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Full delay before retry `attempt`, jitter included
    pub fn delay(&self, attempt: u32) -> Duration {
        self.config.backoff(attempt) + self.jitter()
    }

    fn jitter(&self) -> Duration {
        let max = self.config.max_jitter().as_nanos() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        Duration::from_nanos(rng.gen_range(0..max))
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request cancelled")]
    Cancelled,

    #[error("request body cannot be replayed")]
    NotReplayable,

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Every attempt failed; the last response, if any, is kept for inspection
    #[error("giving up after {attempts} attempts: {reason}")]
    Exhausted {
        attempts: u32,
        reason: String,
        response: Option<Response>,
    },
}

impl TransportError {
    /// Status of the last response when attempts ran out
    pub fn last_status(&self) -> Option<StatusCode> {
        match self {
            TransportError::Exhausted {
                response: Some(response),
                ..
            } => Some(response.status()),
            _ => None,
        }
    }
}

/// Statuses worth retrying: unknown (0), 408, 429 and 5xx
pub fn is_retryable_status(status: u16) -> bool {
    status == 0 || status == 408 || status == 429 || (500..=599).contains(&status)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    // A request that cannot be built fails the same way every time
    !err.is_builder()
}

/// HTTP client that retries transient failures
#[derive(Debug, Clone)]
pub struct RetryableClient {
    client: reqwest::Client,
    backoff: Arc<Backoff>,
}

impl RetryableClient {
    pub fn new(config: RetryConfig, request_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self::with_client(client, Backoff::new(config)))
    }

    pub fn with_client(client: reqwest::Client, backoff: Backoff) -> Self {
        Self {
            client,
            backoff: Arc::new(backoff),
        }
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn config(&self) -> &RetryConfig {
        self.backoff.config()
    }

    /// Send `request`, retrying transient failures.
    ///
    /// Makes at most `max_retries + 1` attempts. Terminal responses (2xx, 3xx,
    /// 4xx other than 408/429) are returned as `Ok` regardless of status.
    pub async fn send(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response, TransportError> {
        let max_retries = self.config().max_retries;
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            let req = request.try_clone().ok_or(TransportError::NotReplayable)?;

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TransportError::Cancelled),
                outcome = self.client.execute(req) => outcome,
            };

            let retry = match &outcome {
                Ok(response) => is_retryable_status(response.status().as_u16()),
                Err(e) => is_retryable_error(e),
            };
            if !retry {
                if attempt > 0 {
                    debug!(url = %request.url(), attempt, "Request settled after retry");
                }
                return outcome.map_err(TransportError::from);
            }

            let reason = match &outcome {
                Ok(response) => format!("status {}", response.status()),
                Err(e) => e.to_string(),
            };

            if attempt >= max_retries {
                warn!(
                    url = %request.url(),
                    attempts = attempt + 1,
                    reason = %reason,
                    "Request failed after max retries"
                );
                return Err(TransportError::Exhausted {
                    attempts: attempt + 1,
                    reason,
                    response: outcome.ok(),
                });
            }

            // Release the connection before waiting
            drop(outcome);

            let delay = self.backoff.delay(attempt);
            warn!(
                url = %request.url(),
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "Request failed, retrying"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TransportError::Cancelled),
                () = sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 5,
            max_jitter_ms: 1,
        }
    }

    /// Serve `statuses` in order (repeating the last) and count hits
    async fn spawn_server(statuses: Vec<u16>) -> (String, Arc<AtomicU32>) {
        let hits = Arc::new(AtomicU32::new(0));
        let state = (hits.clone(), Arc::new(statuses));
        let app = Router::new()
            .route(
                "/",
                get(
                    |State((hits, statuses)): State<(Arc<AtomicU32>, Arc<Vec<u16>>)>| async move {
                        let n = hits.fetch_add(1, Ordering::SeqCst) as usize;
                        let code = statuses[n.min(statuses.len() - 1)];
                        AxumStatus::from_u16(code).unwrap()
                    },
                ),
            )
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/"), hits)
    }

    fn client(config: RetryConfig) -> RetryableClient {
        RetryableClient::with_client(reqwest::Client::new(), Backoff::with_seed(config, 7))
    }

    fn get_request(client: &RetryableClient, url: &str) -> Request {
        client.inner().get(url).build().unwrap()
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay(), Duration::from_millis(100));
        assert_eq!(config.max_delay(), Duration::from_secs(5));
        assert_eq!(config.max_jitter(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(2), Duration::from_millis(400));
        assert_eq!(config.backoff(6), Duration::from_secs(5));
        assert_eq!(config.backoff(40), Duration::from_secs(5));
    }

    #[test]
    fn test_seeded_jitter_is_reproducible() {
        let a = Backoff::with_seed(RetryConfig::default(), 42);
        let b = Backoff::with_seed(RetryConfig::default(), 42);
        for attempt in 0..5 {
            assert_eq!(a.delay(attempt), b.delay(attempt));
        }
    }

    #[test]
    fn test_zero_jitter() {
        let config = RetryConfig {
            max_jitter_ms: 0,
            ..RetryConfig::default()
        };
        let backoff = Backoff::with_seed(config, 1);
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
    }

    #[test]
    fn test_retryable_statuses() {
        for status in [0, 408, 429, 500, 502, 503, 504, 599] {
            assert!(is_retryable_status(status), "{status}");
        }
        for status in [200, 201, 204, 301, 400, 401, 404, 409, 422] {
            assert!(!is_retryable_status(status), "{status}");
        }
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let (url, hits) = spawn_server(vec![200]).await;
        let client = client(fast_config(3));
        let response = client
            .send(get_request(&client, &url), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_terminal_status_not_retried() {
        let (url, hits) = spawn_server(vec![404]).await;
        let client = client(fast_config(3));
        let response = client
            .send(get_request(&client, &url), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_server_errors() {
        let (url, hits) = spawn_server(vec![503, 500, 200]).await;
        let client = client(fast_config(3));
        let response = client
            .send(get_request(&client, &url), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_keeps_last_response() {
        for status in [429, 408, 503] {
            let (url, hits) = spawn_server(vec![status]).await;
            let client = client(fast_config(3));
            let err = client
                .send(get_request(&client, &url), &CancellationToken::new())
                .await
                .unwrap_err();

            assert_eq!(hits.load(Ordering::SeqCst), 4, "status {status}");
            assert_eq!(err.last_status().map(|s| s.as_u16()), Some(status));
            assert!(matches!(err, TransportError::Exhausted { attempts: 4, .. }));
        }
    }

    #[tokio::test]
    async fn test_network_error_is_retried() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client(fast_config(2));
        let err = client
            .send(
                get_request(&client, &format!("http://{addr}/")),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            TransportError::Exhausted {
                attempts, response, ..
            } => {
                assert_eq!(attempts, 3);
                assert!(response.is_none());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let (url, _hits) = spawn_server(vec![503]).await;
        let client = client(RetryConfig {
            max_retries: 3,
            base_delay_ms: 10_000,
            max_delay_ms: 10_000,
            max_jitter_ms: 0,
        });
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = client
            .send(get_request(&client, &url), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_already_cancelled() {
        let (url, hits) = spawn_server(vec![200]).await;
        let client = client(fast_config(3));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client
            .send(get_request(&client, &url), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Cancelled));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
