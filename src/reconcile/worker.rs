//! Per-order unit of work

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::accrual::{AccrualClient, AccrualError};
use crate::models::{Order, OrderStatus};
use crate::store::{ReconcileStore, StoreError};
use crate::transport::TransportError;

/// What happened to one order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Status moved forward (and a credit was booked if due)
    Advanced(OrderStatus),
    /// Report did not move the order; it stays pending
    Unchanged,
    /// The accrual service does not know the order yet
    NotRegistered,
}

#[derive(Debug, Error)]
pub enum JobError {
    /// Downstream asked everyone to back off
    #[error("rate limited for {0:?}")]
    RateLimited(Duration),

    #[error("job cancelled")]
    Cancelled,

    #[error("processor panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Accrual(AccrualError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<AccrualError> for JobError {
    fn from(err: AccrualError) -> Self {
        match err {
            AccrualError::RateLimited { retry_after } => JobError::RateLimited(retry_after),
            AccrualError::Transport(TransportError::Cancelled) => JobError::Cancelled,
            other => JobError::Accrual(other),
        }
    }
}

/// Processes one order on behalf of the worker pool
#[async_trait]
pub trait OrderProcessor: Send + Sync + 'static {
    async fn process(
        &self,
        order: &Order,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, JobError>;
}

/// Fetches the accrual report and persists it
pub struct AccrualProcessor<S> {
    client: AccrualClient,
    store: Arc<S>,
}

impl<S: ReconcileStore> AccrualProcessor<S> {
    pub fn new(client: AccrualClient, store: Arc<S>) -> Self {
        Self { client, store }
    }
}

#[async_trait]
impl<S: ReconcileStore> OrderProcessor for AccrualProcessor<S> {
    async fn process(
        &self,
        order: &Order,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        let Some(report) = self.client.fetch(&order.number, cancel).await? else {
            return Ok(JobOutcome::NotRegistered);
        };

        if !order.status.can_advance_to(report.status) {
            debug!(order = %order.number, current = %order.status, reported = %report.status, "No progress");
            return Ok(JobOutcome::Unchanged);
        }

        if self.store.apply_accrual(order, &report).await? {
            Ok(JobOutcome::Advanced(report.status))
        } else {
            Ok(JobOutcome::Unchanged)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_maps_to_job_error() {
        let err = JobError::from(AccrualError::RateLimited {
            retry_after: Duration::from_secs(2),
        });
        assert!(matches!(err, JobError::RateLimited(d) if d == Duration::from_secs(2)));

        let err = JobError::from(AccrualError::Transport(TransportError::Cancelled));
        assert!(matches!(err, JobError::Cancelled));

        let err = JobError::from(AccrualError::UnexpectedStatus(404));
        assert!(matches!(err, JobError::Accrual(_)));
    }
}
