//! Pausable worker pool
//!
//! N executors (N = host parallelism, fixed at construction) drain a bounded
//! queue of orders. The pool pauses as a unit: once paused, no executor starts
//! a job until [`WorkerPool::resume`] or the pause timer fires.
//!
//! Two tokens govern the lifecycle:
//! - `stop`: no new jobs start, queued ones are abandoned, in-flight ones finish
//! - `cancel`: in-flight jobs are dropped (parent of `stop`)

use std::any::Any;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use futures::FutureExt;
use futures::future::join_all;
use tokio::sync::{Mutex, Notify, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::worker::{JobError, OrderProcessor};
use crate::models::Order;

/// Bounded MPMC queue with async blocking push/pop
pub struct JobQueue<T> {
    slots: ArrayQueue<T>,
    closed: AtomicBool,
    readable: Notify,
    writable: Notify,
}

impl<T> JobQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: ArrayQueue::new(capacity.max(1)),
            closed: AtomicBool::new(false),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Enqueue, waiting for room. Hands the item back if `stop` fires first.
    pub async fn push(&self, mut item: T, stop: &CancellationToken) -> Result<(), T> {
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if stop.is_cancelled() {
                return Err(item);
            }
            match self.slots.push(item) {
                Ok(()) => {
                    self.readable.notify_one();
                    return Ok(());
                }
                Err(back) => item = back,
            }

            tokio::select! {
                () = &mut notified => {}
                () = stop.cancelled() => return Err(item),
            }
        }
    }

    /// Dequeue, waiting for an item. `None` once closed and empty.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let closed = self.closed.load(Ordering::Acquire);
            if let Some(item) = self.slots.pop() {
                self.writable.notify_one();
                return Some(item);
            }
            if closed {
                return None;
            }
            notified.await;
        }
    }

    /// Wake all consumers; they return `None` once the queue is empty
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.readable.notify_waiters();
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    /// Remove everything still queued
    pub fn drain(&self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.slots.len());
        while let Some(item) = self.slots.pop() {
            items.push(item);
        }
        self.writable.notify_waiters();
        items
    }
}

/// Pool-wide pause flag.
///
/// Holds the epoch of the current pause, `None` while running. A pause timer
/// only clears the pause it started.
#[derive(Clone)]
pub struct PauseGate {
    state: Arc<watch::Sender<Option<u64>>>,
    epoch: Arc<AtomicU64>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Pause and return the new epoch; `None` if already paused
    pub fn pause(&self) -> Option<u64> {
        let mut started = None;
        self.state.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
            *state = Some(epoch);
            started = Some(epoch);
            true
        });
        started
    }

    /// Clear the pause; false if not paused
    pub fn resume(&self) -> bool {
        self.state.send_if_modified(|state| state.take().is_some())
    }

    /// Clear the pause only if it is still the one started at `epoch`
    pub fn resume_epoch(&self, epoch: u64) -> bool {
        self.state.send_if_modified(|state| {
            if *state == Some(epoch) {
                *state = None;
                true
            } else {
                false
            }
        })
    }

    /// Watch the current pause epoch (`None` while running)
    pub fn subscribe(&self) -> watch::Receiver<Option<u64>> {
        self.state.subscribe()
    }

    /// Wait until not paused. False if `stop` fired first.
    pub async fn wait_running(&self, stop: &CancellationToken) -> bool {
        let mut rx = self.state.subscribe();
        tokio::select! {
            running = async { rx.wait_for(Option::is_none).await.is_ok() } => running,
            () = stop.cancelled() => false,
        }
    }
}

/// Per-batch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub submitted: usize,
    pub processed: usize,
    pub failed: usize,
    /// Never started, or dropped by a forced shutdown
    pub abandoned: usize,
}

impl BatchReport {
    fn add(&mut self, tally: BatchReport) {
        self.processed += tally.processed;
        self.failed += tally.failed;
        self.abandoned += tally.abandoned;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// In-flight jobs finished before the deadline
    Graceful,
    /// Deadline elapsed, in-flight jobs were cancelled
    Forced,
}

struct PoolInner<P> {
    workers: usize,
    queue: JobQueue<Order>,
    gate: PauseGate,
    processor: P,
    active: AtomicUsize,
    stop: CancellationToken,
    cancel: CancellationToken,
    tracker: TaskTracker,
    batch_lock: Mutex<()>,
}

/// Fixed-size pool of order executors
pub struct WorkerPool<P> {
    inner: Arc<PoolInner<P>>,
}

/// Host parallelism, at least 1
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

impl<P: OrderProcessor> WorkerPool<P> {
    /// `workers` defaults to [`default_workers`]
    pub fn new(processor: P, workers: Option<usize>) -> Self {
        let workers = workers.unwrap_or_else(default_workers).max(1);
        let cancel = CancellationToken::new();
        let stop = cancel.child_token();
        info!(workers, "Worker pool created");

        Self {
            inner: Arc::new(PoolInner {
                workers,
                queue: JobQueue::new(workers),
                gate: PauseGate::new(),
                processor,
                active: AtomicUsize::new(0),
                stop,
                cancel,
                tracker: TaskTracker::new(),
                batch_lock: Mutex::new(()),
            }),
        }
    }

    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    /// Jobs currently executing
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.gate.is_paused()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    pub fn gate(&self) -> &PauseGate {
        &self.inner.gate
    }

    /// Pause for `duration`; no-op (false) if already paused
    pub fn pause(&self, duration: Duration) -> bool {
        self.inner.pause(duration)
    }

    /// Resume immediately; false if not paused
    pub fn resume(&self) -> bool {
        let resumed = self.inner.gate.resume();
        if resumed {
            info!("Worker pool resumed");
        }
        resumed
    }

    /// Run every order through the pool and wait for the batch to finish.
    ///
    /// Batches are serialized: a second caller waits for the first batch.
    pub async fn submit_batch(&self, orders: Vec<Order>) -> BatchReport {
        let inner = &self.inner;
        let _batch = inner.batch_lock.lock().await;

        let mut report = BatchReport {
            submitted: orders.len(),
            ..BatchReport::default()
        };
        if orders.is_empty() {
            return report;
        }
        if inner.stop.is_cancelled() {
            report.abandoned = report.submitted;
            return report;
        }

        inner.queue.reopen();
        let executors = inner.workers.min(orders.len());
        let handles: Vec<_> = (0..executors)
            .map(|id| inner.tracker.spawn(run_executor(inner.clone(), id)))
            .collect();

        for order in orders {
            if let Err(order) = inner.queue.push(order, &inner.stop).await {
                debug!(order = %order.number, "Pool stopping, order not queued");
                report.abandoned += 1;
            }
        }
        inner.queue.close();

        for joined in join_all(handles).await {
            match joined {
                Ok(tally) => report.add(tally),
                Err(e) => error!(error = %e, "Executor task failed"),
            }
        }
        report.abandoned += inner.queue.drain().len();

        debug!(
            submitted = report.submitted,
            processed = report.processed,
            failed = report.failed,
            abandoned = report.abandoned,
            "Batch finished"
        );
        report
    }

    /// Stop starting jobs and wait up to `deadline` for in-flight ones.
    ///
    /// Past the deadline in-flight jobs are cancelled; this never waits longer.
    pub async fn shutdown(&self, deadline: Duration) -> ShutdownOutcome {
        let inner = &self.inner;
        info!(
            active = self.active(),
            deadline_ms = deadline.as_millis() as u64,
            "Worker pool shutting down"
        );
        inner.stop.cancel();
        inner.queue.close();
        inner.tracker.close();

        match timeout(deadline, inner.tracker.wait()).await {
            Ok(()) => {
                info!("Worker pool drained");
                ShutdownOutcome::Graceful
            }
            Err(_) => {
                warn!(
                    active = self.active(),
                    "Shutdown deadline elapsed, cancelling in-flight jobs"
                );
                inner.cancel.cancel();
                ShutdownOutcome::Forced
            }
        }
    }
}

impl<P> Drop for WorkerPool<P> {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl<P> PoolInner<P> {
    fn pause(&self, duration: Duration) -> bool {
        let Some(epoch) = self.gate.pause() else {
            return false;
        };
        warn!(
            pause_ms = duration.as_millis() as u64,
            epoch, "Worker pool paused"
        );

        let gate = self.gate.clone();
        let stop = self.stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = sleep(duration) => {
                    if gate.resume_epoch(epoch) {
                        info!(epoch, "Worker pool auto-resumed");
                    }
                }
                () = stop.cancelled() => {}
            }
        });
        true
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn run_executor<P: OrderProcessor>(inner: Arc<PoolInner<P>>, id: usize) -> BatchReport {
    let mut tally = BatchReport::default();

    loop {
        let order = tokio::select! {
            biased;
            () = inner.stop.cancelled() => break,
            next = inner.queue.pop() => match next {
                Some(order) => order,
                None => break,
            },
        };

        if !inner.gate.wait_running(&inner.stop).await || inner.stop.is_cancelled() {
            tally.abandoned += 1;
            break;
        }

        inner.active.fetch_add(1, Ordering::AcqRel);
        let result = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => Err(JobError::Cancelled),
            caught = AssertUnwindSafe(inner.processor.process(&order, &inner.cancel))
                .catch_unwind() =>
            {
                caught.unwrap_or_else(|panic| {
                    Err(JobError::Panicked(panic_message(panic.as_ref())))
                })
            }
        };
        inner.active.fetch_sub(1, Ordering::AcqRel);

        match result {
            Ok(outcome) => {
                tally.processed += 1;
                debug!(executor = id, order = %order.number, ?outcome, "Job done");
            }
            Err(JobError::RateLimited(retry_after)) => {
                tally.failed += 1;
                warn!(
                    executor = id,
                    order = %order.number,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Accrual service rate limited"
                );
                inner.pause(retry_after);
            }
            Err(JobError::Cancelled) => {
                tally.abandoned += 1;
                debug!(executor = id, order = %order.number, "Job cancelled");
                break;
            }
            Err(e) => {
                tally.failed += 1;
                warn!(executor = id, order = %order.number, error = %e, "Job failed");
            }
        }
    }

    tally
}
