//! Composition root: wires the store, bus, queue, git host, runner pool,
//! engine, triggers, debugger, and gateway together, recovers orphans,
//! and serves HTTP.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api::{AppState, SharedState, api_router};
use crate::cards::CardService;
use crate::config::Config;
use crate::debugger::DebugController;
use crate::engine::PipelineEngine;
use crate::events::EventBus;
use crate::gateway::ws::PoolStatsFeed;
use crate::githost::GitHost;
use crate::queue::{JobQueue, QueuedJob};
use crate::runner::RunnerRegistry;
use crate::store::Store;
use crate::store::db::Db;

/// Build the full application state from a config, running migrations
/// and startup recovery before anything can observe the store.
pub async fn build_state(config: Config) -> Result<SharedState> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data dir {}", config.data_dir.display()))?;
    std::fs::create_dir_all(config.snapshots_dir())
        .context("Failed to create snapshots dir")?;

    let bus = EventBus::new();
    let db = Db::open(&config.db_path()).context("Failed to open store")?;
    let store = Store::new(db, bus);

    // Orphan recovery: anything mid-flight at the last shutdown fails
    // with a stable reason; runner rows reset to disconnected.
    let report = store
        .recover_startup()
        .await
        .context("Startup recovery failed")?;
    if !report.failed_jobs.is_empty() || !report.failed_runs.is_empty() {
        tracing::warn!(
            jobs = report.failed_jobs.len(),
            runs = report.failed_runs.len(),
            "recovered orphaned work at startup"
        );
    }

    let githost = Arc::new(GitHost::new(config.git_root()).context("Failed to open git root")?);
    let queue = Arc::new(JobQueue::new());

    // The queue is process-authoritative but store-reconstructable.
    let queued = store.queued_job_ids().await.context("Queue rebuild failed")?;
    let rebuilt = queued.len();
    queue
        .rebuild(queued.into_iter().map(|(job_id, runner_type)| {
            QueuedJob {
                job_id,
                runner_type,
                // Pinned runners never survive a restart.
                pinned_runner_id: None,
            }
        }))
        .await;
    if rebuilt > 0 {
        tracing::info!(jobs = rebuilt, "rebuilt job queue from store");
    }

    let registry = Arc::new(RunnerRegistry::new(
        store.clone(),
        Arc::clone(&queue),
        Arc::clone(&githost),
        config.clone(),
    ));
    let debugger = Arc::new(DebugController::new(store.clone()));
    let cards = CardService::new(
        store.clone(),
        Arc::clone(&queue),
        Arc::clone(&githost),
        config.clone(),
    );
    let engine = Arc::new(PipelineEngine::new(
        store.clone(),
        Arc::clone(&queue),
        Arc::clone(&githost),
        Arc::clone(&registry),
        Arc::clone(&debugger),
        cards.clone(),
        config.clone(),
    ));
    let triggers = Arc::new(crate::triggers::TriggerService::new(
        store.clone(),
        Arc::clone(&engine),
        Arc::clone(&githost),
    ));
    let pool_feed = Arc::new(PoolStatsFeed::new());

    Ok(Arc::new(AppState {
        store,
        config,
        githost,
        queue,
        registry,
        engine,
        cards,
        debugger,
        triggers,
        pool_feed,
    }))
}

/// Spawn the long-lived background tasks.
pub fn spawn_workers(state: &SharedState) {
    tokio::spawn(Arc::clone(&state.registry).run_dispatcher());
    tokio::spawn(Arc::clone(&state.registry).run_ack_watchdog());
    tokio::spawn(Arc::clone(&state.registry).run_heartbeat_reaper());
    tokio::spawn(state.cards.clone().run_job_watcher());
    tokio::spawn(Arc::clone(&state.triggers).run());
    tokio::spawn(
        Arc::clone(&state.pool_feed).run(state.store.clone(), Arc::clone(&state.registry)),
    );

    // Debug session expiry: auto-abort overdue sessions.
    let debugger = Arc::clone(&state.debugger);
    let engine = Arc::clone(&state.engine);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(30));
        loop {
            tick.tick().await;
            for run_id in debugger.expire_due().await {
                if let Err(e) = engine.cancel(run_id).await {
                    tracing::warn!(run_id, error = %e, "expiry cancel failed");
                }
            }
        }
    });
}

pub fn build_router(state: SharedState) -> Router {
    let mut app = api_router().with_state(Arc::clone(&state));
    if state.config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Start the server and block until shutdown.
pub async fn serve(config: Config) -> Result<()> {
    let state = build_state(config).await?;
    spawn_workers(&state);
    let app = build_router(Arc::clone(&state));

    let host = if state.config.dev_mode {
        "0.0.0.0"
    } else {
        "127.0.0.1"
    };
    let addr = format!("{}:{}", host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Orderly stop: runners get `shutdown`; anything still in flight is
    // recovered by the next startup.
    state.registry.shutdown().await;
    tracing::info!("shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
    }
}
