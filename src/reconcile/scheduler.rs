//! Reconciliation loop
//!
//! Every `interval` the loop fetches pending orders and runs them through the
//! worker pool as one batch, waiting for the batch before the next tick.
//!
//! ```text
//!   Idle --pool paused--> Paused --pool resumed--> Idle
//!   Idle --tick, orders--> Draining --batch done--> Idle | Paused
//!   any --shutdown--> Draining --pool shut down--> Stopped
//! ```
//!
//! While [`Reconciler::run`] is waiting for a tick it follows the pool's pause
//! gate, so `Paused` clears as soon as the pool resumes.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::pool::{BatchReport, ShutdownOutcome, WorkerPool};
use super::worker::OrderProcessor;
use crate::store::ReconcileStore;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub interval_ms: u64,
    pub shutdown_grace_ms: u64,
    /// Executor count; host parallelism when unset
    pub workers: Option<usize>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            shutdown_grace_ms: 4_000,
            workers: None,
        }
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting for the next tick
    Idle,
    /// Pool paused by backpressure; ticks are skipped
    Paused,
    /// A batch or the final shutdown is in progress
    Draining,
    Stopped,
}

pub struct Reconciler<S, P> {
    store: Arc<S>,
    pool: Arc<WorkerPool<P>>,
    config: ReconcilerConfig,
    state: watch::Sender<LoopState>,
}

impl<S: ReconcileStore, P: OrderProcessor> Reconciler<S, P> {
    pub fn new(store: Arc<S>, pool: Arc<WorkerPool<P>>, config: ReconcilerConfig) -> Self {
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            store,
            pool,
            config,
            state,
        }
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    pub fn pool(&self) -> &Arc<WorkerPool<P>> {
        &self.pool
    }

    fn set_state(&self, next: LoopState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            debug!(from = ?state, to = ?next, "Reconciler state");
            *state = next;
            true
        });
    }

    /// Idle or Paused, following the pool
    fn settle(&self) {
        if self.pool.is_paused() {
            self.set_state(LoopState::Paused);
        } else {
            self.set_state(LoopState::Idle);
        }
    }

    /// One reconciliation cycle. `None` when nothing was submitted.
    pub async fn tick(&self) -> Option<BatchReport> {
        if self.pool.is_paused() {
            debug!("Worker pool paused, skipping tick");
            self.set_state(LoopState::Paused);
            return None;
        }

        let orders = match self.store.pending_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                error!(error = %e, "Failed to fetch pending orders");
                self.set_state(LoopState::Idle);
                return None;
            }
        };
        if orders.is_empty() {
            self.set_state(LoopState::Idle);
            return None;
        }

        info!(count = orders.len(), "Reconciling pending orders");
        self.set_state(LoopState::Draining);
        let report = self.pool.submit_batch(orders).await;
        self.settle();

        info!(
            processed = report.processed,
            failed = report.failed,
            abandoned = report.abandoned,
            "Reconciliation batch complete"
        );
        Some(report)
    }

    /// Tick until `shutdown` fires, then shut the pool down within the grace period
    pub async fn run(&self, shutdown: CancellationToken) -> ShutdownOutcome {
        let period = self.config.interval();
        info!(
            interval_ms = period.as_millis() as u64,
            workers = self.pool.workers(),
            "Reconciler started"
        );

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut gate = self.pool.gate().subscribe();
        let mut gate_open = true;

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                changed = gate.changed(), if gate_open => {
                    match changed {
                        Ok(()) => self.settle(),
                        Err(_) => gate_open = false,
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = self.tick() => {}
            }
        }

        self.set_state(LoopState::Draining);
        let outcome = self.pool.shutdown(self.config.shutdown_grace()).await;
        self.set_state(LoopState::Stopped);
        info!(?outcome, "Reconciler stopped");
        outcome
    }
}
