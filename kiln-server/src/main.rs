//! kiln-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Open the SQLite database and run pending migrations.
//! 4. Load the model catalog and build the scheduling core.
//! 5. Start the stale-task reaper and the lane health-probe loop.
//! 6. Build the Axum router and start the HTTP server with graceful shutdown.

mod config;
mod db;
mod error;
mod middleware;
mod routes;
mod state;
mod worker;

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use kiln_core::{
    AdmissionController, DiagnosticsEmitter, GpuWorker, LaneEvent, LaneRegistry, ModelCatalog,
    Router, StaleTaskReaper, TracingSink,
};

use crate::config::Config;
use crate::db::SqliteStore;
use crate::state::AppState;
use crate::worker::HttpWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    // Build the log-level filter, warning loudly if the configured value is
    // not a valid tracing filter expression.
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: KILN_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "kiln-server starting");

    // The worker fleet is expected to run with the allocator's
    // anti-fragmentation setting; the scheduler assumes it but does not set
    // it.  Surface a reminder when this process can't see it either.
    if std::env::var("PYTORCH_CUDA_ALLOC_CONF").is_err() {
        warn!("PYTORCH_CUDA_ALLOC_CONF is not set here; verify it is present on every GPU worker");
    }

    // ── 3. Database ────────────────────────────────────────────────────────────
    let store = Arc::new(SqliteStore::connect(&cfg.database_url).await?);
    info!(database_url = %cfg.database_url, "database ready");

    // ── 4. Model catalog + scheduling core ─────────────────────────────────────
    let catalog = Arc::new(load_catalog(&cfg).await?);
    info!(models = catalog.len(), "model catalog loaded");

    let diagnostics = DiagnosticsEmitter::start(Arc::new(TracingSink));
    let lanes = Arc::new(LaneRegistry::new(&catalog, cfg.lane_policy()));
    let gpu_worker: Arc<dyn GpuWorker> = Arc::new(HttpWorker::new(cfg.worker_url.clone()));
    let router = Arc::new(Router::new(
        Arc::clone(&catalog),
        Arc::clone(&lanes),
        AdmissionController::new(cfg.degraded_policy()),
        Arc::clone(&store),
        diagnostics.clone(),
        Arc::clone(&gpu_worker),
    ));

    // ── 5. Background loops ────────────────────────────────────────────────────
    StaleTaskReaper::new(
        Arc::clone(&store),
        cfg.reaper_policy(),
        diagnostics.clone(),
        router.task_manager(),
    )
    .spawn();
    info!(interval_secs = cfg.reaper_interval_secs, "stale-task reaper running");

    spawn_probe_loop(
        Arc::clone(&gpu_worker),
        Arc::clone(&lanes),
        Arc::clone(&catalog),
        cfg.probe_interval_secs,
    );

    // ── 6. HTTP server with graceful shutdown ──────────────────────────────────
    let state = Arc::new(AppState {
        config: Arc::new(cfg.clone()),
        store,
        catalog,
        lanes,
        router,
        diagnostics,
    });

    let app = routes::build(Arc::clone(&state));
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("kiln-server stopped");
    Ok(())
}

/// Read the catalog file named by `KILN_MODELS_PATH`, or fall back to the
/// embedded default set.
async fn load_catalog(cfg: &Config) -> anyhow::Result<ModelCatalog> {
    match &cfg.models_path {
        Some(path) => {
            let json = tokio::fs::read_to_string(path).await?;
            Ok(ModelCatalog::from_json(&json)?)
        }
        None => Ok(ModelCatalog::builtin()),
    }
}

/// Periodically probe the worker fleet and feed the result into the lane
/// registry.  This is the only path (besides the operator surface) that
/// mutates lane state.
fn spawn_probe_loop(
    worker: Arc<dyn GpuWorker>,
    lanes: Arc<LaneRegistry>,
    catalog: Arc<ModelCatalog>,
    interval_secs: u64,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let event = match worker.probe().await {
                Ok(()) => LaneEvent::ProbeSucceeded,
                Err(e) => {
                    warn!(error = %e, "worker health probe failed");
                    LaneEvent::ProbeFailed
                }
            };
            let now = Utc::now();
            for spec in catalog.iter() {
                if let Err(e) = lanes.apply(&spec.name, event, now) {
                    warn!(model = %spec.name, error = %e, "failed to apply probe result");
                }
            }
        }
    });
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c   => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
