//! Order and ledger storage
//!
//! [`PgStore`] is the PostgreSQL implementation. Every statement it issues goes
//! through the [`RetryingExecutor`], so callers only ever see final outcomes.
//! The reconciliation engine depends on the narrower [`ReconcileStore`] seam.

mod ledger;
mod memory;
mod orders;

pub use memory::MemoryStore;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::Row;
use sqlx::postgres::PgRow;
use thiserror::Error;

use crate::db::{Classify, Database, ErrorClass, RetryingExecutor};
use crate::models::{AccrualReport, Order, OrderStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl Classify for StoreError {
    fn classify(&self) -> ErrorClass {
        match self {
            StoreError::Database(e) => e.classify(),
            StoreError::Corrupt(_) => ErrorClass::NonRetriable,
        }
    }
}

/// Result of submitting an order number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// Same owner submitted it before
    AlreadySubmitted,
    ClaimedByAnotherUser,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid order number: {0}")]
    InvalidNumber(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a withdrawal request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawOutcome {
    Completed,
    /// Nothing was written; `balance` is what the user had
    InsufficientFunds { balance: Decimal },
}

#[derive(Debug, Error)]
pub enum WithdrawError {
    #[error("invalid withdrawal amount: {0}")]
    InvalidAmount(Decimal),

    #[error("invalid order number: {0}")]
    InvalidOrderNumber(String),

    /// Another withdrawal already used this order number
    #[error("order number already used for a withdrawal: {0}")]
    OrderNumberUsed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Storage operations the reconciliation engine needs
#[async_trait]
pub trait ReconcileStore: Send + Sync + 'static {
    /// Orders in NEW or PROCESSING
    async fn pending_orders(&self) -> Result<Vec<Order>, StoreError>;

    /// Apply an accrual report in one transaction.
    ///
    /// The status moves only forward; a PROCESSED report with a positive accrual
    /// also appends a ledger credit, at most once per order. Returns whether
    /// the order advanced.
    async fn apply_accrual(&self, order: &Order, report: &AccrualReport)
    -> Result<bool, StoreError>;
}

/// PostgreSQL-backed order and ledger store
#[derive(Clone)]
pub struct PgStore {
    db: Database,
    executor: RetryingExecutor,
}

impl PgStore {
    pub fn new(db: Database, executor: RetryingExecutor) -> Self {
        Self { db, executor }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

fn order_from_row(row: &PgRow) -> Result<Order, StoreError> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<OrderStatus>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(Order {
        number: row.try_get("number")?,
        owner: row.try_get("owner")?,
        status,
        accrual: row.try_get("accrual")?,
        submitted_at: row.try_get("submitted_at")?,
    })
}
