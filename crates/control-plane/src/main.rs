// Keel API server
// Decision: One process hosts the control API, the worker pool, the schedule
// evaluator and the retention sweeper over shared in-memory stores

use std::sync::Arc;

use anyhow::{Context, Result};
use keel_control_plane::ServerConfig;
use keel_durable::activity::ActivityExecutor;
use keel_durable::builtin::{EchoActivity, FailActivity, SequenceWorkflow, SleepActivity};
use keel_durable::clock::system_clock;
use keel_durable::engine::{WorkflowExecutor, WorkflowRegistry};
use keel_durable::persistence::{InMemoryWorkflowEventStore, RetentionSweeper};
use keel_durable::queue::InMemoryTaskQueue;
use keel_durable::schedule::{InMemoryScheduleStore, ScheduleManager, TriggerEvaluator};
use keel_durable::worker::WorkerPool;
use keel_durable::{ControlApi, ControlConfig};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    // Configure via RUST_LOG (default: "keel_durable=info,keel_control_plane=info,tower_http=info")
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("keel_durable=info,keel_control_plane=info,tower_http=info")
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("keel-control-plane starting...");

    let config = ServerConfig::from_env().context("Invalid configuration")?;
    tracing::info!(?config, "Configuration loaded");

    let clock = system_clock();
    let store = Arc::new(InMemoryWorkflowEventStore::with_clock(clock.clone()));
    let queue = Arc::new(InMemoryTaskQueue::with_config(
        config.queue_config(),
        clock.clone(),
    ));

    let executor = Arc::new(
        WorkflowExecutor::new(
            store.clone(),
            queue,
            WorkflowRegistry::new().with::<SequenceWorkflow>(),
            config.executor_config(),
        )
        .with_clock(clock.clone()),
    );

    // Re-dispatch work of runs left open by a previous process
    let recovered = executor
        .recover()
        .await
        .context("Failed to recover open runs")?;
    if recovered > 0 {
        tracing::info!(recovered, "Recovered open runs");
    }

    let activities = Arc::new(
        ActivityExecutor::new()
            .with(EchoActivity)
            .with(SleepActivity)
            .with(FailActivity),
    );
    let pool = WorkerPool::new(executor.clone(), activities, config.worker_pool_config());
    pool.start().context("Failed to start worker pool")?;

    let schedule_store = Arc::new(InMemoryScheduleStore::new());
    let schedules =
        Arc::new(ScheduleManager::new(schedule_store.clone()).with_clock(clock.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let evaluator = TriggerEvaluator::new(
        schedule_store,
        executor.clone(),
        clock.clone(),
        config.evaluator_config(),
    )
    .spawn(shutdown_rx.clone());
    // Retries enqueues that failed after their events were persisted
    let redispatcher = executor.clone().spawn_redispatcher(shutdown_rx.clone());
    let sweeper =
        RetentionSweeper::new(store, clock, config.retention_config()).spawn(shutdown_rx);

    let control = Arc::new(ControlApi::new(executor, schedules, ControlConfig::default()));
    let app = keel_control_plane::app(control, &config);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Shutting down background tasks");
    let _ = shutdown_tx.send(true);
    if let Err(e) = pool.shutdown().await {
        tracing::warn!(error = %e, "Worker pool did not shut down cleanly");
    }
    let _ = tokio::join!(evaluator, redispatcher, sweeper);

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
