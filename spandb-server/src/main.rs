//! SpanDB Server - HTTP API for the trace block store

mod api;
mod config;

use anyhow::Context;
use clap::Parser;
use config::{LogConfig, ServerConfig};
use prometheus::Registry;
use spandb_core::backend::{new_backend, BackendReader, CachedReader};
use spandb_core::cache::{BackgroundCache, Cache, MemoryCache};
use spandb_core::compactor::{Compactor, NoOverrides, OwnAll};
use spandb_core::db::Db;
use spandb_core::ingester::Ingester;
use spandb_core::metrics::Metrics;
use spandb_core::model::object_decoder;
use spandb_core::CURRENT_DATA_ENCODING;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// SpanDB trace storage server
#[derive(Debug, Parser)]
#[command(name = "spandb", version, about)]
struct Args {
    /// TOML configuration file; defaults apply when omitted
    #[arg(short, long, env = "SPANDB_CONFIG")]
    config: Option<PathBuf>,
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);
    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    init_tracing(&config.log);

    info!("Starting SpanDB server v{}", spandb_core::VERSION);
    info!("Backend: {:?}", config.backend);
    info!("WAL directory: {:?}", config.db.wal.dir);

    let registry = Registry::new();
    let metrics = Arc::new(Metrics::new(&registry).context("failed to register metrics")?);

    // Storage
    let backend = new_backend(&config.backend).context("failed to open backend")?;
    let mut cache: Option<Arc<dyn Cache>> = None;
    let reader: Arc<dyn BackendReader> = if config.cache.enabled {
        let policy = config.cache.background.policy()?;
        let memory = Arc::new(MemoryCache::new(config.cache.memory.clone()));
        let background: Arc<dyn Cache> = Arc::new(BackgroundCache::new(
            memory,
            &config.cache.background,
            policy,
            metrics.clone(),
        ));
        cache = Some(background.clone());
        info!(policy = ?policy, "Read cache enabled");
        Arc::new(CachedReader::new(backend.reader.clone(), background, metrics.clone()))
    } else {
        backend.reader.clone()
    };

    let db = Arc::new(
        Db::new(
            config.db.clone(),
            reader,
            backend.writer.clone(),
            backend.compactor.clone(),
            metrics,
        )
        .context("failed to create db")?,
    );
    db.poll_blocklist().await.context("initial blocklist poll failed")?;

    let ingester = Ingester::start(config.ingester.clone(), db.clone())
        .await
        .context("failed to start ingester")?;
    let compactor = Arc::new(Compactor::new(
        config.compactor.clone(),
        db.clone(),
        Arc::new(OwnAll),
        Arc::new(NoOverrides),
    ));

    // Background loops
    let shutdown = CancellationToken::new();
    let tasks = vec![
        tokio::spawn(db.clone().run_polling(shutdown.clone())),
        tokio::spawn(compactor.run(shutdown.clone())),
        tokio::spawn(ingester.clone().run(shutdown.clone())),
    ];

    let state = api::AppState {
        db,
        ingester: ingester.clone(),
        decoder: object_decoder(CURRENT_DATA_ENCODING)?,
        registry,
    };
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;
    info!("SpanDB server listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("Shutdown signal received");
        })
        .await?;

    // Flush everything the ingester holds before the loops stop
    ingester.stop().await;
    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "background task panicked");
        }
    }
    if let Some(cache) = cache {
        cache.stop().await;
    }

    info!("SpanDB server stopped");
    Ok(())
}
