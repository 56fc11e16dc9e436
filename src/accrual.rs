//! Client for the external accrual service
//!
//! `GET {base_url}/api/orders/{number}`:
//! - 200: JSON [`AccrualReport`]
//! - 204: order not registered yet
//! - 429: rate limited, `Retry-After` in seconds

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::AccrualReport;
use crate::transport::{RetryConfig, RetryableClient, TransportError};

/// Pause applied when a 429 carries no usable `Retry-After`
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AccrualConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub retry: RetryConfig,
}

impl Default for AccrualConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".to_string(),
            request_timeout_ms: 10_000,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AccrualError {
    #[error("accrual service rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("unexpected accrual response status {0}")]
    UnexpectedStatus(u16),

    #[error("malformed accrual response: {0}")]
    Decode(#[source] reqwest::Error),

    #[error("accrual report for {got} returned when {expected} was requested")]
    OrderMismatch { expected: String, got: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Typed accrual service client over the retryable transport
#[derive(Debug, Clone)]
pub struct AccrualClient {
    base_url: String,
    transport: RetryableClient,
}

impl AccrualClient {
    pub fn new(config: &AccrualConfig) -> Result<Self, AccrualError> {
        let transport = RetryableClient::new(
            config.retry.clone(),
            Duration::from_millis(config.request_timeout_ms),
        )?;
        Ok(Self::with_transport(&config.base_url, transport))
    }

    pub fn with_transport(base_url: &str, transport: RetryableClient) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            transport,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Current accrual state of `number`, `None` while the service does not know it
    pub async fn fetch(
        &self,
        number: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<AccrualReport>, AccrualError> {
        let url = format!("{}/api/orders/{}", self.base_url, number);
        let request = self
            .transport
            .inner()
            .get(&url)
            .build()
            .map_err(TransportError::from)?;

        let response = match self.transport.send(request, cancel).await {
            Ok(response) => response,
            Err(TransportError::Exhausted {
                response: Some(response),
                ..
            }) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                return Err(AccrualError::RateLimited {
                    retry_after: retry_after(response.headers()),
                });
            }
            Err(e) => return Err(e.into()),
        };

        match response.status() {
            StatusCode::OK => {
                let report: AccrualReport = response.json().await.map_err(AccrualError::Decode)?;
                if report.order != number {
                    return Err(AccrualError::OrderMismatch {
                        expected: number.to_string(),
                        got: report.order,
                    });
                }
                debug!(order = number, status = %report.status, "Accrual report received");
                Ok(Some(report))
            }
            StatusCode::NO_CONTENT => {
                debug!(order = number, "Order not registered with accrual service");
                Ok(None)
            }
            status => Err(AccrualError::UnexpectedStatus(status.as_u16())),
        }
    }
}

/// `Retry-After` in whole seconds, falling back to [`DEFAULT_RETRY_AFTER`]
pub fn retry_after(headers: &HeaderMap) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}
