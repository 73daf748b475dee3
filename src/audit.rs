//! Audit pipeline and background job handlers
//!
//! An audit drains the cadence window for one thread, scores and redacts
//! each turn, persists the keepers through the engine, records the run,
//! and optionally asks the completion capability for a thread summary.
//! Research jobs publish opaque capsule requests; write-batch jobs flush
//! deferred durable writes in one transaction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::cadence::CadenceTracker;
use crate::engine::MemoryEngine;
use crate::error::{MnemoError, Result};
use crate::jobs::{JobHandler, JobPayload, JobQueue, WriteOp};
use crate::providers::{PubSub, TextCompletion};
use crate::scoring::{self, TurnContext, QUALITY_THRESHOLD};
use crate::storage::{queries, Storage};
use crate::types::{MemoryAudit, SaveMemoryInput, ThreadSummary};

/// PubSub channel for research capsule requests
pub const RESEARCH_CHANNEL: &str = "research:requests";
/// Token budget for thread summaries
const SUMMARY_MAX_TOKENS: usize = 200;

static GREETINGS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "hi", "hello", "hey", "yo", "sup", "thanks", "thank you", "ok", "okay", "cool", "nice",
        "good morning", "good evening", "good night", "bye", "goodbye",
    ]
});

/// Messages too trivial to research: short, or a bare greeting
pub fn is_trivial_message(content: &str) -> bool {
    let trimmed = content.trim().to_lowercase();
    if trimmed.chars().count() <= 10 {
        return true;
    }
    let stripped = trimmed.trim_end_matches(['!', '.', '?']);
    GREETINGS.contains(&stripped)
}

/// Counters for rejected inputs, exposed on the metrics endpoint
#[derive(Default)]
pub struct RejectionCounters {
    pub all_redacted: AtomicU64,
    pub invalid_input: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionSnapshot {
    pub all_redacted: u64,
    pub invalid_input: u64,
}

impl RejectionCounters {
    pub fn snapshot(&self) -> RejectionSnapshot {
        RejectionSnapshot {
            all_redacted: self.all_redacted.load(Ordering::Relaxed),
            invalid_input: self.invalid_input.load(Ordering::Relaxed),
        }
    }
}

/// Handles `audit` jobs
pub struct AuditHandler {
    storage: Storage,
    engine: Arc<MemoryEngine>,
    cadence: Arc<CadenceTracker>,
    jobs: JobQueue,
    completion: Option<Arc<dyn TextCompletion>>,
    rejections: Arc<RejectionCounters>,
}

impl AuditHandler {
    pub fn new(
        storage: Storage,
        engine: Arc<MemoryEngine>,
        cadence: Arc<CadenceTracker>,
        jobs: JobQueue,
        completion: Option<Arc<dyn TextCompletion>>,
        rejections: Arc<RejectionCounters>,
    ) -> Self {
        Self {
            storage,
            engine,
            cadence,
            jobs,
            completion,
            rejections,
        }
    }

    /// Run one audit for (user, thread); returns the recorded stats
    pub async fn run_audit(&self, user_id: &str, thread_id: &str) -> Result<MemoryAudit> {
        let now = Utc::now();
        let window = self.cadence.mark_audit_complete(user_id, thread_id, now);
        let window_len = window.len();

        let mut saved: i64 = 0;
        let mut token_count: i64 = 0;
        let mut score_sum: f32 = 0.0;

        for (position, turn) in window.iter().enumerate() {
            token_count += turn.tokens;
            let score = scoring::quality_score(
                turn.role,
                &turn.content,
                TurnContext {
                    position,
                    window_len,
                },
            );
            score_sum += score;

            if score < QUALITY_THRESHOLD {
                continue;
            }

            let input = SaveMemoryInput {
                user_id: user_id.to_string(),
                thread_id: thread_id.to_string(),
                content: turn.content.clone(),
                priority: Some(score),
                tier: None,
                confidence: Some(score),
                entities: None,
                explicit: false,
            };
            match self.engine.save(input).await {
                Ok(_) => saved += 1,
                Err(MnemoError::InvalidInput(reason)) => {
                    self.rejections.all_redacted.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(%reason, "Audit turn rejected");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Audit turn failed to save");
                }
            }
        }

        let audit = MemoryAudit {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            thread_id: thread_id.to_string(),
            start_msg_id: window.first().map(|t| t.msg_id.clone()),
            end_msg_id: window.last().map(|t| t.msg_id.clone()),
            token_count,
            score: if window_len > 0 {
                score_sum / window_len as f32
            } else {
                0.0
            },
            saved,
            created_at: now,
        };

        // The audit record rides the write-behind batch
        self.jobs.enqueue(JobPayload::WriteBatch {
            ops: vec![WriteOp::RecordAudit {
                audit: audit.clone(),
            }],
        });

        if window_len > 0 {
            self.maybe_summarize(user_id, thread_id, &window).await;
        }

        tracing::info!(
            user_id,
            thread_id,
            turns = window_len,
            saved,
            "Audit finished"
        );
        Ok(audit)
    }

    async fn maybe_summarize(&self, user_id: &str, thread_id: &str, window: &[crate::cadence::BufferedTurn]) {
        let Some(ref completion) = self.completion else {
            return;
        };

        let transcript: String = window
            .iter()
            .map(|t| format!("{:?}: {}\n", t.role, t.content))
            .collect();

        match completion
            .complete(
                "Summarize this conversation fragment in two sentences. Keep durable facts.",
                &transcript,
                SUMMARY_MAX_TOKENS,
            )
            .await
        {
            Ok(summary) if !summary.trim().is_empty() => {
                let row = ThreadSummary {
                    thread_id: thread_id.to_string(),
                    user_id: user_id.to_string(),
                    summary: summary.trim().to_string(),
                    updated_at: Utc::now(),
                    deleted: false,
                };
                if let Err(e) = self
                    .storage
                    .with_write(|conn| queries::upsert_thread_summary(conn, &row))
                {
                    tracing::warn!(error = %e, "Failed to store thread summary");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "Thread summary skipped"),
        }
    }
}

#[async_trait]
impl JobHandler for AuditHandler {
    async fn handle(&self, payload: JobPayload) -> Result<()> {
        match payload {
            JobPayload::Audit { user_id, thread_id } => {
                self.run_audit(&user_id, &thread_id).await?;
                Ok(())
            }
            other => Err(MnemoError::Job(format!(
                "audit handler got {} payload",
                other.job_type().as_str()
            ))),
        }
    }
}

/// Handles `research` jobs: publishes a capsule request when a PubSub
/// capability is wired, otherwise a logged no-op
pub struct ResearchHandler {
    pubsub: Option<Arc<dyn PubSub>>,
}

impl ResearchHandler {
    pub fn new(pubsub: Option<Arc<dyn PubSub>>) -> Self {
        Self { pubsub }
    }
}

#[async_trait]
impl JobHandler for ResearchHandler {
    async fn handle(&self, payload: JobPayload) -> Result<()> {
        let JobPayload::Research {
            user_id,
            thread_id,
            content,
        } = payload
        else {
            return Err(MnemoError::Job("research handler got wrong payload".to_string()));
        };

        match self.pubsub {
            Some(ref pubsub) => {
                pubsub
                    .publish(
                        RESEARCH_CHANNEL,
                        serde_json::json!({
                            "userId": user_id,
                            "threadId": thread_id,
                            "content": content,
                            "requestedAt": Utc::now().to_rfc3339(),
                        }),
                    )
                    .await
            }
            None => {
                tracing::debug!(user_id, thread_id, "Research requested, no pubsub wired");
                Ok(())
            }
        }
    }
}

/// Handles `write-batch` jobs: one transaction per batch
pub struct WriteBatchHandler {
    storage: Storage,
}

impl WriteBatchHandler {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl JobHandler for WriteBatchHandler {
    async fn handle(&self, payload: JobPayload) -> Result<()> {
        let JobPayload::WriteBatch { ops } = payload else {
            return Err(MnemoError::Job("write-batch handler got wrong payload".to_string()));
        };

        let now = Utc::now();
        self.storage.with_transaction(|conn| {
            for op in &ops {
                match op {
                    WriteOp::RecordAudit { audit } => queries::insert_audit(conn, audit)?,
                    WriteOp::QueueEmbedding { memory_id, content } => {
                        queries::enqueue_embedding(conn, memory_id, content, now)?;
                    }
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingService;
    use crate::jobs::JobType;
    use crate::providers::{KvStore, MemoryKv};
    use crate::types::{ListOptions, MessageEvent, Role, TokenUsage};

    fn handler() -> (AuditHandler, Arc<CadenceTracker>, Storage, JobQueue) {
        let storage = Storage::open_in_memory().unwrap();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let embeddings = Arc::new(EmbeddingService::new(None, kv.clone(), 8));
        let engine = Arc::new(MemoryEngine::new(storage.clone(), embeddings, kv));
        let cadence = Arc::new(CadenceTracker::new());
        let jobs = JobQueue::new();
        jobs.register(JobType::WriteBatch, Arc::new(WriteBatchHandler::new(storage.clone())));
        let audit = AuditHandler::new(
            storage.clone(),
            engine,
            cadence.clone(),
            jobs.clone(),
            None,
            Arc::new(RejectionCounters::default()),
        );
        (audit, cadence, storage, jobs)
    }

    fn event(n: usize, content: &str) -> MessageEvent {
        MessageEvent {
            user_id: "u1".to_string(),
            thread_id: "t1".to_string(),
            msg_id: format!("m{n}"),
            role: Role::User,
            content: content.to_string(),
            tokens: TokenUsage { input: 40, output: 0 },
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn audit_saves_qualifying_turns_and_records_run() {
        let (audit, cadence, storage, jobs) = handler();
        let now = Utc::now();

        cadence.record_message(&event(0, "hello there"), now);
        cadence.record_message(&event(1, "my name is Dana and I work at Meridian Labs"), now);
        cadence.record_message(&event(2, "i prefer short answers by the way"), now);

        let stats = audit.run_audit("u1", "t1").await.unwrap();
        assert_eq!(stats.token_count, 120);
        assert_eq!(stats.saved, 2);
        assert_eq!(stats.start_msg_id.as_deref(), Some("m0"));
        assert_eq!(stats.end_msg_id.as_deref(), Some("m2"));

        // The audit row lands once the write-behind batch flushes
        jobs.drain().await;
        let audits = storage.with_read(queries::count_audits).unwrap();
        assert_eq!(audits, 1);

        let engine_rows = storage
            .with_read(|conn| queries::list_memories(conn, "u1", &ListOptions { limit: 10, ..Default::default() }))
            .unwrap();
        assert_eq!(engine_rows.1, 2);
    }

    #[tokio::test]
    async fn empty_window_still_records_an_audit() {
        let (audit, _, storage, jobs) = handler();
        let stats = audit.run_audit("u1", "t1").await.unwrap();
        assert_eq!(stats.saved, 0);
        assert_eq!(stats.token_count, 0);

        jobs.drain().await;
        assert_eq!(storage.with_read(queries::count_audits).unwrap(), 1);
    }

    #[tokio::test]
    async fn research_without_pubsub_is_a_noop() {
        let handler = ResearchHandler::new(None);
        let result = handler
            .handle(JobPayload::Research {
                user_id: "u1".to_string(),
                thread_id: "t1".to_string(),
                content: "look up the new sqlite release".to_string(),
            })
            .await;
        assert!(result.is_ok());
    }

    #[test]
    fn triviality_filter() {
        assert!(is_trivial_message("hi"));
        assert!(is_trivial_message("thank you!"));
        assert!(is_trivial_message("ok"));
        assert!(!is_trivial_message("how does the retention engine decay priorities?"));
    }
}
