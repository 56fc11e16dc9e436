//! Loyalty reconciler service
//!
//! ```text
//! ┌──────────┐    ┌────────────┐    ┌────────────┐    ┌──────────┐
//! │  Ticker  │───▶│  Pending   │───▶│ WorkerPool │───▶│ Accrual  │
//! │  (5s)    │    │  orders    │    │ (N execs)  │    │ service  │
//! └──────────┘    └────────────┘    └─────┬──────┘    └──────────┘
//!                                         │ status + credit (one tx)
//!                                         ▼
//!                                   ┌────────────┐
//!                                   │ PostgreSQL │
//!                                   └────────────┘
//! ```

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use loyalty_reconciler::{
    AccrualClient, AccrualProcessor, AppConfig, Database, PgStore, Reconciler, RetryingExecutor,
    WorkerPool, logging,
};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env).with_context(|| format!("loading {env} config"))?;
    let _log_guard = logging::init_logging(&app_config);

    tracing::info!(
        env = %env,
        git_hash = env!("GIT_HASH"),
        "Starting loyalty reconciler"
    );

    let db = Database::connect(&app_config.database)
        .await
        .context("connecting to PostgreSQL")?;
    db.health_check().await.context("database health check")?;
    db.init_schema().await.context("initializing schema")?;

    let store = Arc::new(PgStore::new(
        db.clone(),
        RetryingExecutor::new(app_config.storage_retry.clone()),
    ));
    let client = AccrualClient::new(&app_config.accrual).context("building accrual client")?;
    tracing::info!(accrual = client.base_url(), "Accrual service configured");

    let pool = Arc::new(WorkerPool::new(
        AccrualProcessor::new(client, store.clone()),
        app_config.reconciler.workers,
    ));
    let reconciler = Reconciler::new(store, pool, app_config.reconciler.clone());

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        trigger.cancel();
    });

    let outcome = reconciler.run(shutdown).await;
    db.close().await;
    tracing::info!(?outcome, "Loyalty reconciler exited");
    Ok(())
}
