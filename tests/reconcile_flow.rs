//! End-to-end reconciliation against a fake accrual service
//!
//! Storage is the in-memory store; the accrual service is an axum server on
//! 127.0.0.1:0 that replays a scripted sequence of responses per order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use loyalty_reconciler::{
    AccrualClient, AccrualProcessor, Backoff, LoopState, MemoryStore, Order, OrderStatus,
    Reconciler, ReconcilerConfig, RetryConfig, RetryableClient, ShutdownOutcome, WorkerPool,
};

#[derive(Clone)]
enum Reply {
    Report(&'static str, Option<&'static str>),
    NoContent,
    RateLimited(Option<&'static str>),
    Status(u16),
}

/// Per-order replies; the last one repeats
#[derive(Default)]
struct Script {
    replies: Mutex<HashMap<String, Vec<Reply>>>,
    hits: Mutex<HashMap<String, usize>>,
}

impl Script {
    fn set(&self, order: &str, replies: Vec<Reply>) {
        self.replies.lock().unwrap().insert(order.to_string(), replies);
    }

    fn hits(&self, order: &str) -> usize {
        self.hits.lock().unwrap().get(order).copied().unwrap_or(0)
    }
}

async fn accrual_handler(
    State(script): State<Arc<Script>>,
    Path(number): Path<String>,
) -> Response {
    let n = {
        let mut hits = script.hits.lock().unwrap();
        let n = hits.entry(number.clone()).or_default();
        *n += 1;
        *n - 1
    };
    let reply = {
        let replies = script.replies.lock().unwrap();
        match replies.get(&number) {
            Some(list) => list[n.min(list.len() - 1)].clone(),
            None => Reply::NoContent,
        }
    };

    match reply {
        Reply::Report(status, accrual) => {
            let body = match accrual {
                Some(a) => format!(r#"{{"order":"{number}","status":"{status}","accrual":{a}}}"#),
                None => format!(r#"{{"order":"{number}","status":"{status}"}}"#),
            };
            (
                StatusCode::OK,
                [("content-type", "application/json")],
                body,
            )
                .into_response()
        }
        Reply::NoContent => StatusCode::NO_CONTENT.into_response(),
        Reply::RateLimited(Some(after)) => {
            (StatusCode::TOO_MANY_REQUESTS, [("retry-after", after)]).into_response()
        }
        Reply::RateLimited(None) => StatusCode::TOO_MANY_REQUESTS.into_response(),
        Reply::Status(code) => StatusCode::from_u16(code).unwrap().into_response(),
    }
}

async fn spawn_accrual(script: Arc<Script>) -> String {
    let app = Router::new()
        .route("/api/orders/{number}", get(accrual_handler))
        .with_state(script);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

type Engine = Reconciler<MemoryStore, AccrualProcessor<MemoryStore>>;

async fn engine(script: Arc<Script>, interval_ms: u64) -> (Arc<MemoryStore>, Engine) {
    let base_url = spawn_accrual(script).await;
    let retry = RetryConfig {
        max_retries: 1,
        base_delay_ms: 1,
        max_delay_ms: 5,
        max_jitter_ms: 1,
    };
    let transport =
        RetryableClient::with_client(reqwest::Client::new(), Backoff::with_seed(retry, 11));
    let client = AccrualClient::with_transport(&base_url, transport);

    let store = Arc::new(MemoryStore::new());
    let pool = Arc::new(WorkerPool::new(
        AccrualProcessor::new(client, store.clone()),
        Some(4),
    ));
    let config = ReconcilerConfig {
        interval_ms,
        shutdown_grace_ms: 1_000,
        workers: Some(4),
    };
    (store.clone(), Reconciler::new(store, pool, config))
}

async fn wait_until<F: Fn() -> bool>(limit: Duration, cond: F) {
    tokio::time::timeout(limit, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_processed_order_credits_balance() {
    let script = Arc::new(Script::default());
    script.set("79927398713", vec![Reply::Report("PROCESSED", Some("50.0"))]);
    let (store, reconciler) = engine(script, 5_000).await;
    store.insert_order(Order::new("79927398713", 42));

    let report = reconciler.tick().await.unwrap();
    assert_eq!(report.processed, 1);

    let order = store.order("79927398713").unwrap();
    assert_eq!(order.status, OrderStatus::Processed);
    assert_eq!(order.accrual, Some(Decimal::from(50)));
    assert_eq!(store.balance(42).current, Decimal::from(50));

    // Terminal orders are not fetched again
    assert!(reconciler.tick().await.is_none());
    assert_eq!(store.ledger().len(), 1);
}

#[tokio::test]
async fn test_status_walks_forward_across_ticks() {
    let script = Arc::new(Script::default());
    script.set(
        "12345678903",
        vec![
            Reply::Report("REGISTERED", None),
            Reply::Report("PROCESSING", None),
            Reply::Report("REGISTERED", None),
            Reply::Report("INVALID", None),
            Reply::Report("PROCESSING", None),
        ],
    );
    let (store, reconciler) = engine(script.clone(), 5_000).await;
    store.insert_order(Order::new("12345678903", 1));
    let status = || store.order("12345678903").unwrap().status;

    reconciler.tick().await;
    assert_eq!(status(), OrderStatus::New);
    reconciler.tick().await;
    assert_eq!(status(), OrderStatus::Processing);
    // Stale REGISTERED never moves it back
    reconciler.tick().await;
    assert_eq!(status(), OrderStatus::Processing);
    reconciler.tick().await;
    assert_eq!(status(), OrderStatus::Invalid);

    // Terminal: later replies are never requested
    assert!(reconciler.tick().await.is_none());
    assert_eq!(status(), OrderStatus::Invalid);
    assert_eq!(script.hits("12345678903"), 4);
    assert_eq!(store.balance(1).current, Decimal::ZERO);
}

#[tokio::test]
async fn test_unknown_and_failing_orders_stay_pending() {
    let script = Arc::new(Script::default());
    script.set("79927398713", vec![Reply::Report("PROCESSED", Some("12.341"))]);
    script.set("4561261212345467", vec![Reply::Status(500)]);
    script.set("12345678903", vec![Reply::NoContent]);
    let (store, reconciler) = engine(script.clone(), 5_000).await;
    for number in ["79927398713", "4561261212345467", "12345678903"] {
        store.insert_order(Order::new(number, 9));
    }

    let report = reconciler.tick().await.unwrap();
    assert_eq!(report.submitted, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.processed, 2);

    assert_eq!(store.order("4561261212345467").unwrap().status, OrderStatus::New);
    assert_eq!(store.order("12345678903").unwrap().status, OrderStatus::New);
    // 500 retried once by the transport
    assert_eq!(script.hits("4561261212345467"), 2);
    // Normalised to two decimal places
    assert_eq!(store.balance(9).current, Decimal::new(1234, 2));

    let pending = reconciler.tick().await.unwrap();
    assert_eq!(pending.submitted, 2);
}

#[tokio::test]
async fn test_rate_limit_pauses_then_resumes() {
    let script = Arc::new(Script::default());
    script.set(
        "79927398713",
        vec![
            Reply::RateLimited(Some("2")),
            Reply::RateLimited(Some("2")),
            Reply::Report("PROCESSED", Some("50")),
        ],
    );
    let (store, reconciler) = engine(script, 100).await;
    store.insert_order(Order::new("79927398713", 5));

    let reconciler = Arc::new(reconciler);
    let shutdown = CancellationToken::new();
    let started = Instant::now();
    let running = {
        let reconciler = reconciler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { reconciler.run(shutdown).await })
    };

    wait_until(Duration::from_secs(2), || reconciler.pool().is_paused()).await;
    let mut state = reconciler.subscribe();
    state
        .wait_for(|s| *s == LoopState::Paused)
        .await
        .unwrap();

    wait_until(Duration::from_secs(6), || {
        store.order("79927398713").unwrap().status == OrderStatus::Processed
    })
    .await;
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(!reconciler.pool().is_paused());
    assert_eq!(store.balance(5).current, Decimal::from(50));

    shutdown.cancel();
    assert_eq!(running.await.unwrap(), ShutdownOutcome::Graceful);
    assert_eq!(reconciler.state(), LoopState::Stopped);
}

#[tokio::test]
async fn test_shutdown_is_bounded_by_grace_period() {
    let script = Arc::new(Script::default());
    script.set("79927398713", vec![Reply::NoContent]);
    let (store, reconciler) = engine(script, 50).await;
    store.insert_order(Order::new("79927398713", 5));

    let reconciler = Arc::new(reconciler);
    let shutdown = CancellationToken::new();
    let running = {
        let reconciler = reconciler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { reconciler.run(shutdown).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stopping = Instant::now();
    shutdown.cancel();
    running.await.unwrap();
    assert!(stopping.elapsed() < Duration::from_secs(2));
    assert_eq!(reconciler.state(), LoopState::Stopped);

    // A stopped pool refuses further work
    let report = reconciler.pool().submit_batch(vec![Order::new("1", 1)]).await;
    assert_eq!(report.abandoned, 1);
}
