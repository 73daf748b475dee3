//! Background embedding worker
//!
//! Drains the persistent backlog every 30 seconds (and once at start):
//! batch-embeds the oldest unprocessed items, writes vectors onto their
//! memories, and retires items that keep failing so they never loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::embedding::EmbeddingService;
use crate::error::Result;
use crate::storage::{queries, Storage};

/// Interval between drain passes
pub const PROCESSING_INTERVAL_MS: u64 = 30_000;
/// Items pulled per pass
pub const BATCH_SIZE: i64 = 100;
/// Retries before an item is retired with an error
pub const MAX_RETRIES: i64 = 3;

pub struct EmbeddingWorker {
    storage: Storage,
    service: Arc<EmbeddingService>,
    processing: AtomicBool,
}

impl EmbeddingWorker {
    pub fn new(storage: Storage, service: Arc<EmbeddingService>) -> Self {
        Self {
            storage,
            service,
            processing: AtomicBool::new(false),
        }
    }

    /// Timer loop; runs one pass immediately, then every interval
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(PROCESSING_INTERVAL_MS));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.process_pending().await {
                        tracing::error!(error = %e, "Embedding drain pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Embedding worker stopped");
    }

    /// One drain pass. Guarded so only a single pass runs at a time.
    /// Returns the number of items embedded.
    pub async fn process_pending(&self) -> Result<usize> {
        if !self.service.is_configured() {
            return Ok(0);
        }
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(0);
        }
        let result = self.drain_batch().await;
        self.processing.store(false, Ordering::SeqCst);
        result
    }

    async fn drain_batch(&self) -> Result<usize> {
        let items = self
            .storage
            .with_read(|conn| queries::pending_embeddings(conn, BATCH_SIZE))?;
        if items.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = items.iter().map(|i| i.content.clone()).collect();
        let now = Utc::now();

        match self.service.generate_batch(&texts).await {
            Ok(vectors) => {
                let mut embedded = 0;
                self.storage.with_transaction(|conn| {
                    for (item, vector) in items.iter().zip(vectors.into_iter()) {
                        match vector {
                            Some(v) => {
                                queries::set_embedding(conn, &item.memory_id, &v, now)?;
                                queries::mark_embedding_processed(conn, &item.id, None, now)?;
                                embedded += 1;
                            }
                            None => {
                                let retries =
                                    queries::bump_embedding_retry(conn, &item.id, "no vector returned")?;
                                if retries > MAX_RETRIES {
                                    queries::mark_embedding_processed(
                                        conn,
                                        &item.id,
                                        Some("retries exhausted"),
                                        now,
                                    )?;
                                }
                            }
                        }
                    }
                    Ok(())
                })?;
                tracing::info!(embedded, total = items.len(), "Processed embedding backlog batch");
                Ok(embedded)
            }
            Err(e) => {
                let message = e.to_string();
                self.storage.with_transaction(|conn| {
                    for item in &items {
                        let retries = queries::bump_embedding_retry(conn, &item.id, &message)?;
                        if retries > MAX_RETRIES {
                            queries::mark_embedding_processed(conn, &item.id, Some(&message), now)?;
                        }
                    }
                    Ok(())
                })?;
                tracing::warn!(error = %message, items = items.len(), "Embedding batch failed");
                Ok(0)
            }
        }
    }
}
