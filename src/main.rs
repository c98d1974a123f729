use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use receipt_intake::config::{PipelineConfig, load_env_file};
use receipt_intake::events::EventBus;
use receipt_intake::ingest::{Deduplicator, GmailSource, IngestionPoller, LocalAttachmentStore};
use receipt_intake::processing::{NarrativeAnalyzer, ProcessingEngine};
use receipt_intake::scheduler::{FirstTick, spawn_recurring};
use receipt_intake::server::router;
use receipt_intake::submissions::SubmissionRepository;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_file_loaded = load_env_file(None).context("Invalid .env file")?;
    let config = PipelineConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        poll_interval = ?config.poll_interval,
        process_tick = ?config.process_tick,
        env_file_loaded,
        "Receipt intake starting"
    );

    let bus = EventBus::new();
    let repo = SubmissionRepository::new(Arc::clone(&bus));

    let store = LocalAttachmentStore::new(&config.uploads_dir);
    store
        .ensure_dir()
        .await
        .with_context(|| format!("Failed to create {}", config.uploads_dir.display()))?;

    // ── Processing ──────────────────────────────────────────────────────
    let analyzer = Arc::new(NarrativeAnalyzer::new(config.stream_chunk));
    let engine = Arc::new(ProcessingEngine::new(
        Arc::clone(&repo),
        analyzer,
        config.max_processing,
    ));
    let mut tickers = vec![spawn_recurring(
        engine,
        config.process_tick,
        FirstTick::Immediate,
    )];

    // ── Ingestion ───────────────────────────────────────────────────────
    match config.gmail {
        Ok(gmail) => {
            info!(inbox = %gmail.address, "Gmail ingestion enabled");
            let source = GmailSource::new(gmail).context("Failed to build Gmail client")?;
            let filter = source.inbox_filter();
            let poller = IngestionPoller::new(
                Arc::new(source),
                Arc::new(store),
                Arc::new(Deduplicator::new()),
                Arc::clone(&repo),
                filter,
            )
            .with_policy(config.attachment_policy);
            tickers.push(spawn_recurring(
                Arc::new(poller),
                config.poll_interval,
                FirstTick::Immediate,
            ));
        }
        Err(e) => warn!(error = %e, "Gmail credentials not configured, ingestion disabled"),
    }

    // ── Server ──────────────────────────────────────────────────────────
    let app = router(Arc::clone(&repo), config.uploads_dir.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    info!(addr = %listener.local_addr()?, "Listening for HTTP and WebSocket clients");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down background tasks");
    for ticker in tickers {
        ticker.shutdown().await;
    }
    info!("Shutdown complete");
    Ok(())
}

/// Console logging, plus daily-rolling files when `log_dir` is set. The
/// returned guard flushes the file writer on drop.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "receipt-intake.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
