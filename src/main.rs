use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use deal_relay::api;
use deal_relay::config::{PipelineConfig, RateStoreKind};
use deal_relay::delivery::{DryRunPublisher, Publisher, TelegramPublisher};
use deal_relay::ingest::SpoolSource;
use deal_relay::pipeline::Pipeline;
use deal_relay::ratelimit::{MemoryRateStore, RateStore};
use deal_relay::store::{LibSqlBackend, Store};
use deal_relay::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("📦 Deal Relay v{}", env!("CARGO_PKG_VERSION"));

    let metrics = telemetry::install_recorder().context("Failed to install metrics recorder")?;

    // ── Database ─────────────────────────────────────────────────────────
    let backend = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    let store: Arc<dyn Store> = backend.clone();
    eprintln!("   Database: {}", config.db_path.display());

    let rate_store: Arc<dyn RateStore> = match config.rate_store {
        RateStoreKind::Memory => Arc::new(MemoryRateStore::new()),
        RateStoreKind::Shared => backend.clone(),
    };
    eprintln!(
        "   Rate limit: {} per {}s ({:?} store)",
        config.rate.global.limit,
        config.rate.global.window.as_secs(),
        config.rate_store
    );

    // ── Delivery ─────────────────────────────────────────────────────────
    let publisher: Arc<dyn Publisher> = match &config.telegram {
        Some(telegram) => Arc::new(TelegramPublisher::new(telegram.clone())),
        None => {
            eprintln!("   Warning: TELEGRAM_BOT_TOKEN/TELEGRAM_CHANNEL_ID not set, dry run only");
            Arc::new(DryRunPublisher)
        }
    };
    eprintln!("   Publisher: {}", publisher.name());

    // ── Pipeline ─────────────────────────────────────────────────────────
    let pipeline = Arc::new(Pipeline::new(config, store, rate_store, publisher));
    pipeline.start().await.context("Failed to start pipeline")?;
    let config = pipeline.config();

    eprintln!(
        "   Queue: capacity {} ({}), {} delivery workers",
        config.queue.capacity, config.queue.policy, config.delivery_workers
    );

    if let Some(dir) = &config.spool_dir {
        let source = Arc::new(SpoolSource::new(dir));
        pipeline.spawn_ingestion(source, config.ingestion_workers);
        eprintln!("   Spool: {}", dir.display());
    }

    // ── Status API ───────────────────────────────────────────────────────
    let server_stop = CancellationToken::new();
    if let Some(port) = config.status_port {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
            .await
            .with_context(|| format!("Failed to bind status port {port}"))?;
        let app = api::routes(Arc::clone(&pipeline), metrics);
        let stop = server_stop.clone();
        tokio::spawn(async move {
            tracing::info!(port, "Status API started");
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(stop.cancelled_owned())
                .await
            {
                tracing::error!(error = %e, "Status API stopped");
            }
        });
        eprintln!("   Status API: http://0.0.0.0:{port}/api/status");
        eprintln!("   Metrics: http://0.0.0.0:{port}/metrics");
    }

    eprintln!("   Press Ctrl-C to stop.\n");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    eprintln!("\n   Shutting down…");
    server_stop.cancel();
    pipeline.shutdown(config.shutdown_grace).await;
    Ok(())
}

/// Stderr logging filtered by `RUST_LOG` (default `info`), plus a daily
/// rolling file when a log directory is configured.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "deal-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .init();
            None
        }
    }
}
