//! Reconciliation engine
//!
//! [`Reconciler`] ticks, pulls pending orders from the store and hands them to
//! the [`WorkerPool`]; each executor runs an [`OrderProcessor`] per order.

pub mod pool;
pub mod scheduler;
pub mod worker;

pub use pool::{BatchReport, JobQueue, PauseGate, ShutdownOutcome, WorkerPool, default_workers};
pub use scheduler::{LoopState, Reconciler, ReconcilerConfig};
pub use worker::{AccrualProcessor, JobError, JobOutcome, OrderProcessor};
