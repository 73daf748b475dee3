//! Mnemo memory service
//!
//! Run with: mnemo-server

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use mnemo::api::{self, AppContext};
use mnemo::audit::{AuditHandler, RejectionCounters, ResearchHandler, WriteBatchHandler};
use mnemo::cadence::{CadenceTracker, IDLE_EXPIRY_SECS};
use mnemo::embedding::{create_provider, EmbeddingService, EmbeddingWorker};
use mnemo::engine::MemoryEngine;
use mnemo::jobs::{JobQueue, JobType};
use mnemo::profile::ProfileBuilder;
use mnemo::providers::{KvStore, MemoryKv};
use mnemo::recall::RecallEngine;
use mnemo::retention::RetentionEngine;
use mnemo::storage::Storage;
use mnemo::types::{EmbeddingSettings, StorageConfig};

#[derive(Parser, Debug)]
#[command(name = "mnemo-server")]
#[command(about = "Per-user conversational memory service")]
struct Args {
    /// Database path
    #[arg(long, env = "MNEMO_DB_PATH", default_value = "data/mnemo.db")]
    db_path: String,

    /// Bind address for the HTTP API
    #[arg(long, env = "MNEMO_BIND", default_value = "127.0.0.1:8370")]
    bind: String,

    /// Read connection pool size
    #[arg(long, env = "MNEMO_READ_POOL", default_value = "4")]
    read_pool: usize,

    /// OpenAI-compatible embeddings base URL (unset = keyword-only recall)
    #[arg(long, env = "MNEMO_EMBEDDING_URL")]
    embedding_url: Option<String>,

    /// Embedding API key
    #[arg(long, env = "MNEMO_EMBEDDING_API_KEY")]
    embedding_api_key: Option<String>,

    /// Embedding model name
    #[arg(long, env = "MNEMO_EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    embedding_model: String,

    /// Embedding dimensions (must match the model output)
    #[arg(long, env = "MNEMO_EMBEDDING_DIMENSIONS", default_value = "1536")]
    embedding_dimensions: usize,

    /// Retention sweep interval in seconds
    #[arg(long, env = "MNEMO_RETENTION_INTERVAL", default_value = "86400")]
    retention_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mnemo=info,tower_http=warn")),
        )
        .init();

    let args = Args::parse();
    tracing::info!(version = mnemo::VERSION, db_path = %args.db_path, "Starting mnemo");

    // init
    let storage = Storage::open(StorageConfig {
        db_path: args.db_path.clone(),
        read_pool_size: args.read_pool,
    })
    .context("opening database")?;

    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());

    let embedding_settings = EmbeddingSettings {
        base_url: args.embedding_url.clone(),
        api_key: args.embedding_api_key.clone(),
        model: args.embedding_model.clone(),
        dimensions: args.embedding_dimensions,
        batch_size: 100,
    };
    let provider = create_provider(&embedding_settings);
    if provider.is_none() {
        tracing::warn!("No embedding provider configured; recall is keyword-only");
    }
    let embeddings = Arc::new(EmbeddingService::new(
        provider,
        kv.clone(),
        embedding_settings.dimensions,
    ));

    let engine = Arc::new(MemoryEngine::new(storage.clone(), embeddings.clone(), kv.clone()));
    let recall = Arc::new(RecallEngine::new(storage.clone(), embeddings.clone()));
    let profiles = Arc::new(ProfileBuilder::new(storage.clone(), kv.clone()));
    let cadence = Arc::new(CadenceTracker::new());
    let jobs = JobQueue::new();
    let rejections = Arc::new(RejectionCounters::default());

    jobs.register(
        JobType::Audit,
        Arc::new(AuditHandler::new(
            storage.clone(),
            engine.clone(),
            cadence.clone(),
            jobs.clone(),
            None,
            rejections.clone(),
        )),
    );
    jobs.register(JobType::Research, Arc::new(ResearchHandler::new(None)));
    jobs.register(JobType::WriteBatch, Arc::new(WriteBatchHandler::new(storage.clone())));

    // run
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let queue_worker = jobs.clone();
    let queue_shutdown = shutdown_rx.clone();
    tokio::spawn(async move { queue_worker.run(queue_shutdown).await });

    let retention = RetentionEngine::new(storage.clone(), Duration::from_secs(args.retention_interval_secs));
    tokio::spawn(retention.run(shutdown_rx.clone()));

    let embedding_worker = Arc::new(EmbeddingWorker::new(storage.clone(), embeddings.clone()));
    tokio::spawn(embedding_worker.run(shutdown_rx.clone()));

    let sweeper_cadence = cadence.clone();
    let mut sweeper_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(IDLE_EXPIRY_SECS as u64 / 24));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let dropped = sweeper_cadence.sweep_idle(Utc::now());
                    if dropped > 0 {
                        tracing::debug!(dropped, "Swept idle cadence state");
                    }
                }
                _ = sweeper_shutdown.changed() => {
                    if *sweeper_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    let ctx = Arc::new(AppContext {
        storage: storage.clone(),
        cadence,
        jobs: jobs.clone(),
        embeddings,
        engine,
        recall,
        profiles,
        rejections,
        started_at: Utc::now(),
    });

    let app = api::router(ctx);
    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    tracing::info!(bind = %args.bind, "API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("serving API")?;

    // shutdown: flush the write-behind stage, stop timers, close the store
    shutdown_tx.send(true).ok();
    jobs.drain().await;
    storage.checkpoint().ok();
    tracing::info!("Shutdown complete");

    Ok(())
}
