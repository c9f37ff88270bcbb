use anyhow::Context;
use kiln_print_queue::api::{self, ApiState};
use kiln_print_queue::config::AppConfig;
use kiln_print_queue::photo::HttpPhotoRenderer;
use kiln_print_queue::protocol::PollHandler;
use kiln_print_queue::queue::QueueManager;
use kiln_print_queue::runner::TaskRunner;
use kiln_print_queue::sentry_init;
use kiln_print_queue::store::SqliteQueueStore;
use kiln_print_queue::supabase_client::SupabaseClient;
use kiln_print_queue::telemetry::{TelemetryCollector, TelemetryReporter};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Console logging, plus daily rolling files when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "kiln-print-queue.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(file_layer)
        .with(sentry_tracing::layer())
        .init();

    guard
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;

    let _log_guard = init_tracing(config.log_dir.as_deref());

    info!("========================================");
    info!("Kiln Print Queue Starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("========================================");

    let _sentry_guard = sentry_init::init();

    let db_path = config.database_path();
    let store = Arc::new(
        SqliteQueueStore::open(db_path.clone())
            .await
            .context("Failed to open queue store")?,
    );
    info!("Database initialized at: {:?}", db_path);

    let telemetry = Arc::new(TelemetryCollector::new());
    let hook = Arc::new(SupabaseClient::new(
        config.supabase_url.clone(),
        config.service_role_key.clone(),
    ));

    let runner = TaskRunner::new(
        store.clone(),
        hook,
        config.runner_config(),
        telemetry.clone(),
    );
    let sweeper = runner.start_retention_sweep(config.sweep_interval(), config.max_task_age());

    let queue_manager = Arc::new(QueueManager::new(
        runner.clone(),
        telemetry.clone(),
        config.task_wait_timeout(),
        config.removal_match,
    ));

    let photo_renderer = Arc::new(
        HttpPhotoRenderer::new(config.printer.image_width).context("Failed to build photo client")?,
    );
    let poll_handler = Arc::new(PollHandler::new(
        queue_manager.clone(),
        photo_renderer,
        telemetry.clone(),
        config.ticket_options(),
    ));

    let reporter = TelemetryReporter::new(telemetry.clone());
    let report_task =
        reporter.start_reporting(Duration::from_secs(config.telemetry_report_secs.max(1)));

    let state = ApiState {
        queue_manager,
        poll_handler,
        telemetry,
        reject_duplicates: config.reject_duplicates,
        start_time: Instant::now(),
    };

    info!("Background services initialized");

    let served = api::start_api_server(&config.listen_addr, state, shutdown_signal()).await;

    info!("Kiln Print Queue shutting down...");

    report_task.abort();
    runner.shutdown().await;
    if let Err(e) = sweeper.await {
        error!("Retention sweep task ended abnormally: {}", e);
    }
    if let Err(e) = store.close().await {
        error!("Failed to close queue store: {}", e);
    }

    served.context("HTTP API server failed")?;
    Ok(())
}
