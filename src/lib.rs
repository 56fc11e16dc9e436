//! Loyalty reconciler - accrual reconciliation engine
//!
//! Polls an external accrual service for pending orders and folds the results
//! into a per-user points ledger.
//!
//! # Modules
//!
//! - [`models`] - Order, accrual report and ledger types
//! - [`validation`] - Luhn check for order numbers
//! - [`db`] - Connection pool, schema, error classifier and retrying executor
//! - [`transport`] - HTTP client with exponential backoff and jitter
//! - [`accrual`] - Typed client for the accrual service
//! - [`store`] - Orders and ledger (submission, reads, withdrawals)
//! - [`reconcile`] - Worker pool and reconciliation loop
//! - [`config`] / [`logging`] - Process setup

pub mod accrual;
pub mod config;
pub mod db;
pub mod logging;
pub mod models;
pub mod reconcile;
pub mod store;
pub mod transport;
pub mod validation;

// Convenient re-exports at crate root
pub use accrual::{AccrualClient, AccrualConfig, AccrualError};
pub use config::{AppConfig, ConfigError};
pub use db::{Database, DatabaseConfig, ErrorClass, RetryingExecutor, StorageRetryConfig};
pub use models::{AccrualReport, Balance, LedgerEntry, Order, OrderStatus, UserId, Withdrawal};
pub use reconcile::{
    AccrualProcessor, BatchReport, LoopState, OrderProcessor, Reconciler, ReconcilerConfig,
    ShutdownOutcome, WorkerPool,
};
pub use store::{
    MemoryStore, PgStore, ReconcileStore, StoreError, SubmitError, SubmitOutcome, WithdrawError,
    WithdrawOutcome,
};
pub use transport::{Backoff, RetryConfig, RetryableClient, TransportError};
