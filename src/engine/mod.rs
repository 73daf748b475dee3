//! Memory engine: create, supercede, patch, list and cross-thread tracking
//!
//! Every write path keeps the FTS index in sync inside the same
//! transaction and converges duplicate content onto a single surviving
//! row (supercede).

pub mod topics;

use std::sync::Arc;

use chrono::Utc;

use crate::embedding::{cosine_similarity, EmbeddingService};
use crate::error::{MnemoError, Result};
use crate::profile;
use crate::providers::KvStore;
use crate::redaction::{is_all_redacted, redact_pii, Redaction};
use crate::storage::{queries, Storage};
use crate::types::{
    ListOptions, Memory, MemoryPatch, SaveMemoryInput, SaveOutcome, Tier, MAX_CONTENT_CHARS,
};

/// Textual similarity threshold for supercede
pub const SUPERCEDE_THRESHOLD: f32 = 0.75;
/// Cosine threshold for embedding-based duplicate detection
pub const EMBEDDING_DUP_THRESHOLD: f32 = 0.85;
/// How many recent live memories the textual matcher scans
pub const CANDIDATE_WINDOW: i64 = 50;
/// Bound on embedded candidates for the semantic matcher
const SEMANTIC_CANDIDATES: i64 = 100;

pub struct MemoryEngine {
    storage: Storage,
    embeddings: Arc<EmbeddingService>,
    kv: Arc<dyn KvStore>,
}

impl MemoryEngine {
    pub fn new(storage: Storage, embeddings: Arc<EmbeddingService>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            storage,
            embeddings,
            kv,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Supercede-or-create. Redacts, finds a sufficiently similar live
    /// memory for the user, and either updates it in place or inserts a
    /// new row. Returns the surviving memory.
    pub async fn save(&self, input: SaveMemoryInput) -> Result<(Memory, SaveOutcome)> {
        let trimmed = input.content.trim();
        if trimmed.is_empty() {
            return Err(MnemoError::InvalidInput("content is empty".to_string()));
        }
        let content: String = trimmed.chars().take(MAX_CONTENT_CHARS).collect();

        let redaction = redact_pii(&content);
        if is_all_redacted(&redaction.redacted) {
            return Err(MnemoError::InvalidInput(
                "content is entirely redacted".to_string(),
            ));
        }

        // Semantic match first when an embedder is available; the textual
        // matcher still runs as a backstop so near-verbatim restatements
        // converge even when the provider is down or vectors disagree.
        let mut new_embedding: Option<Vec<f32>> = None;
        let mut matched: Option<Memory> = None;

        if self.embeddings.is_configured() {
            if let Ok(Some(vector)) = self.embeddings.generate(&redaction.redacted).await {
                matched = self.semantic_match(&input.user_id, &vector)?;
                new_embedding = Some(vector);
            }
        }
        if matched.is_none() {
            matched = self.textual_match(&input.user_id, &redaction.redacted)?;
        }

        match matched {
            Some(existing) => {
                let memory = self
                    .supercede(existing, &input, redaction, new_embedding)
                    .await?;
                Ok((memory, SaveOutcome::Superceded))
            }
            None => {
                let memory = self.create(&input, redaction, new_embedding).await?;
                Ok((memory, SaveOutcome::Created))
            }
        }
    }

    /// Nearest live memory by cosine similarity, at or above the
    /// duplicate-detection threshold
    fn semantic_match(&self, user_id: &str, vector: &[f32]) -> Result<Option<Memory>> {
        let candidates = self
            .storage
            .with_read(|conn| queries::live_memories_with_embeddings(conn, user_id, SEMANTIC_CANDIDATES))?;

        let best = candidates
            .into_iter()
            .filter_map(|m| {
                let similarity = m.embedding.as_deref().map(|e| cosine_similarity(e, vector))?;
                Some((similarity, m))
            })
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        Ok(best
            .filter(|(similarity, _)| *similarity >= EMBEDDING_DUP_THRESHOLD)
            .map(|(_, m)| m))
    }

    /// Topic-equal match over the recent window, falling back to a plain
    /// textual scan
    fn textual_match(&self, user_id: &str, content: &str) -> Result<Option<Memory>> {
        let candidates = self
            .storage
            .with_read(|conn| queries::recent_live_memories(conn, user_id, CANDIDATE_WINDOW))?;

        if let Some(topic) = topics::detect_topic(content) {
            for candidate in &candidates {
                if topics::detect_topic(&candidate.content).as_deref() == Some(topic.as_str())
                    && topics::text_similarity(content, &candidate.content) >= SUPERCEDE_THRESHOLD
                {
                    return Ok(Some(candidate.clone()));
                }
            }
        }

        let best = candidates
            .into_iter()
            .map(|m| (topics::text_similarity(content, &m.content), m))
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        Ok(best
            .filter(|(similarity, _)| *similarity >= SUPERCEDE_THRESHOLD)
            .map(|(_, m)| m))
    }

    async fn supercede(
        &self,
        mut memory: Memory,
        input: &SaveMemoryInput,
        redaction: Redaction,
        new_embedding: Option<Vec<f32>>,
    ) -> Result<Memory> {
        let now = Utc::now();

        memory.content = redaction.redacted;
        memory.redaction_map = redaction.map;
        memory.updated_at = now;
        memory.decayed_weeks = 0;
        memory.last_seen_at = now;
        memory.repeats += 1;
        memory.thread_id = input.thread_id.clone();
        if !memory.thread_set.contains(&input.thread_id) {
            memory.thread_set.push(input.thread_id.clone());
        }
        if let Some(priority) = input.priority {
            memory.priority = memory.priority.max(priority).clamp(0.0, 1.0);
        }
        if let Some(confidence) = input.confidence {
            memory.confidence = memory.confidence.max(confidence).clamp(0.0, 1.0);
        }
        if let Some(ref entities) = input.entities {
            memory.entities = Some(entities.clone());
        }
        // Automatic saves retain the existing tier; explicit saves may
        // override it
        if input.explicit {
            if let Some(tier) = input.tier {
                memory.tier = tier;
            }
        }

        let needs_queue = match new_embedding {
            Some(vector) => {
                memory.embedding = Some(vector);
                memory.embedding_updated_at = Some(now);
                false
            }
            None => {
                // Content changed under the old vector
                memory.embedding = None;
                memory.embedding_updated_at = None;
                true
            }
        };

        let snapshot = memory.clone();
        self.storage.with_transaction(|conn| {
            queries::update_memory(conn, &snapshot)?;
            queries::fts_sync(conn, &snapshot)?;
            if needs_queue {
                queries::enqueue_embedding(conn, &snapshot.id, &snapshot.content, now)?;
            }
            Ok(())
        })?;

        tracing::debug!(memory_id = %memory.id, repeats = memory.repeats, "Superceded memory");
        self.invalidate_profile(&memory.user_id, memory.tier).await;
        Ok(memory)
    }

    async fn create(
        &self,
        input: &SaveMemoryInput,
        redaction: Redaction,
        new_embedding: Option<Vec<f32>>,
    ) -> Result<Memory> {
        let now = Utc::now();
        let tier = input.tier.unwrap_or_else(|| {
            if input.explicit {
                Tier::T1
            } else {
                crate::scoring::detect_tier(&redaction.redacted)
            }
        });

        let has_embedding = new_embedding.is_some();
        let memory = Memory {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: input.user_id.clone(),
            thread_id: input.thread_id.clone(),
            content: redaction.redacted,
            entities: input.entities.clone(),
            priority: input.priority.unwrap_or(0.5).clamp(0.0, 1.0),
            confidence: input.confidence.unwrap_or(0.75).clamp(0.0, 1.0),
            redaction_map: redaction.map,
            tier,
            source_thread_id: input.thread_id.clone(),
            repeats: 1,
            thread_set: vec![input.thread_id.clone()],
            last_seen_at: now,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            embedding: new_embedding,
            embedding_updated_at: has_embedding.then_some(now),
            decayed_weeks: 0,
        };

        self.storage.with_transaction(|conn| {
            queries::insert_memory(conn, &memory)?;
            queries::fts_sync(conn, &memory)?;
            if !has_embedding {
                queries::enqueue_embedding(conn, &memory.id, &memory.content, now)?;
            }
            Ok(())
        })?;

        tracing::debug!(memory_id = %memory.id, tier = %memory.tier, "Created memory");
        self.invalidate_profile(&memory.user_id, memory.tier).await;
        Ok(memory)
    }

    pub fn get(&self, user_id: &str, id: &str) -> Result<Option<Memory>> {
        self.storage.with_read(|conn| queries::get_memory(conn, user_id, id))
    }

    pub fn list(&self, user_id: &str, options: &ListOptions) -> Result<(Vec<Memory>, i64)> {
        self.storage.with_read(|conn| queries::list_memories(conn, user_id, options))
    }

    /// Apply a PATCH: content and priority updates, or soft delete
    pub async fn patch(&self, user_id: &str, id: &str, patch: MemoryPatch) -> Result<Memory> {
        let mut memory = self
            .get(user_id, id)?
            .ok_or_else(|| MnemoError::NotFound(id.to_string()))?;

        if patch.is_empty() {
            return Err(MnemoError::InvalidInput("empty patch".to_string()));
        }
        let now = Utc::now();

        if patch.deleted == Some(true) {
            self.storage.with_transaction(|conn| {
                queries::soft_delete_memory(conn, user_id, id, now)?;
                queries::fts_remove(conn, id)
            })?;
            memory.deleted_at = Some(now);
            memory.updated_at = now;
            self.invalidate_profile(user_id, memory.tier).await;
            return Ok(memory);
        }

        let mut content_changed = false;
        if let Some(ref content) = patch.content {
            let trimmed = content.trim();
            if trimmed.is_empty() {
                return Err(MnemoError::InvalidInput("content is empty".to_string()));
            }
            let redaction = redact_pii(&trimmed.chars().take(MAX_CONTENT_CHARS).collect::<String>());
            if is_all_redacted(&redaction.redacted) {
                return Err(MnemoError::InvalidInput(
                    "content is entirely redacted".to_string(),
                ));
            }
            memory.content = redaction.redacted;
            memory.redaction_map = redaction.map;
            // Stale vector must not survive a content change
            memory.embedding = None;
            memory.embedding_updated_at = None;
            content_changed = true;
        }
        if let Some(priority) = patch.priority {
            memory.priority = priority.clamp(0.0, 1.0);
        }
        memory.updated_at = now;
        memory.decayed_weeks = 0;

        let snapshot = memory.clone();
        self.storage.with_transaction(|conn| {
            queries::update_memory(conn, &snapshot)?;
            if content_changed {
                queries::fts_sync(conn, &snapshot)?;
                queries::enqueue_embedding(conn, &snapshot.id, &snapshot.content, now)?;
            }
            Ok(())
        })?;

        self.invalidate_profile(user_id, memory.tier).await;
        Ok(memory)
    }

    /// Record that an existing memory was observed in another thread
    pub async fn observe_in_thread(&self, user_id: &str, id: &str, thread_id: &str) -> Result<Memory> {
        let mut memory = self
            .get(user_id, id)?
            .ok_or_else(|| MnemoError::NotFound(id.to_string()))?;

        let now = Utc::now();
        memory.repeats += 1;
        memory.last_seen_at = now;
        memory.updated_at = now;
        memory.decayed_weeks = 0;
        if !memory.thread_set.contains(&thread_id.to_string()) {
            memory.thread_set.push(thread_id.to_string());
        }

        let snapshot = memory.clone();
        self.storage
            .with_transaction(|conn| queries::update_memory(conn, &snapshot))?;
        Ok(memory)
    }

    /// Drop the cached profile when a tier-1/2 memory changes
    async fn invalidate_profile(&self, user_id: &str, tier: Tier) {
        if tier != Tier::T3 {
            self.kv.del(&profile::cache_key(user_id)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::test_support::StubEmbedder;
    use crate::providers::MemoryKv;
    use pretty_assertions::assert_eq;

    fn engine_without_embedder() -> MemoryEngine {
        let storage = Storage::open_in_memory().unwrap();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let embeddings = Arc::new(EmbeddingService::new(None, kv.clone(), 8));
        MemoryEngine::new(storage, embeddings, kv)
    }

    fn engine_with_embedder() -> MemoryEngine {
        let storage = Storage::open_in_memory().unwrap();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let embedder = Arc::new(StubEmbedder::new(8));
        let embeddings = Arc::new(EmbeddingService::new(Some(embedder), kv.clone(), 8));
        MemoryEngine::new(storage, embeddings, kv)
    }

    fn save_input(content: &str) -> SaveMemoryInput {
        SaveMemoryInput::explicit("u1", "t1", content)
    }

    #[tokio::test]
    async fn explicit_save_defaults_to_t1() {
        let engine = engine_without_embedder();
        let (memory, outcome) = engine.save(save_input("my favorite color is blue")).await.unwrap();
        assert_eq!(outcome, SaveOutcome::Created);
        assert_eq!(memory.tier, Tier::T1);
        assert_eq!(memory.repeats, 1);
    }

    #[tokio::test]
    async fn restatement_supercedes_instead_of_duplicating() {
        let engine = engine_without_embedder();

        let (first, _) = engine
            .save(SaveMemoryInput {
                priority: Some(0.9),
                ..save_input("my favorite color is blue")
            })
            .await
            .unwrap();

        let (second, outcome) = engine
            .save(SaveMemoryInput {
                thread_id: "t2".to_string(),
                ..save_input("my favorite color is green")
            })
            .await
            .unwrap();

        assert_eq!(outcome, SaveOutcome::Superceded);
        assert_eq!(second.id, first.id);
        assert_eq!(second.content, "my favorite color is green");
        assert_eq!(second.repeats, 2);
        assert!(second.priority >= 0.9);
        assert_eq!(second.tier, Tier::T1);
        assert_eq!(second.thread_set, vec!["t1".to_string(), "t2".to_string()]);

        let (rows, total) = engine.list("u1", &ListOptions { limit: 10, ..Default::default() }).unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn semantic_match_supercedes_with_embedder() {
        let engine = engine_with_embedder();

        let (first, _) = engine.save(save_input("i use neovim as my editor")).await.unwrap();
        // Identical token bag => cosine 1.0 with the stub embedder
        let (second, outcome) = engine.save(save_input("i use neovim as my editor")).await.unwrap();

        assert_eq!(outcome, SaveOutcome::Superceded);
        assert_eq!(second.id, first.id);
        assert!(second.embedding.is_some());
    }

    #[tokio::test]
    async fn unrelated_contents_stay_separate() {
        let engine = engine_without_embedder();
        engine.save(save_input("my favorite color is blue")).await.unwrap();
        let (_, outcome) = engine.save(save_input("the staging deploy uses terraform")).await.unwrap();
        assert_eq!(outcome, SaveOutcome::Created);

        let (_, total) = engine.list("u1", &ListOptions { limit: 10, ..Default::default() }).unwrap();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn all_redacted_content_is_rejected() {
        let engine = engine_without_embedder();
        let err = engine.save(save_input("dev@example.com")).await.unwrap_err();
        assert!(matches!(err, MnemoError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn pii_is_masked_and_reversible() {
        let engine = engine_without_embedder();
        let (memory, _) = engine
            .save(save_input("my email is dev@example.com for alerts"))
            .await
            .unwrap();

        assert!(!memory.content.contains("dev@example.com"));
        let map = memory.redaction_map.as_ref().unwrap();
        assert_eq!(
            crate::redaction::restore_pii(&memory.content, map),
            "my email is dev@example.com for alerts"
        );
    }

    #[tokio::test]
    async fn patch_updates_content_and_invalidates_vector() {
        let engine = engine_with_embedder();
        let (memory, _) = engine.save(save_input("i work at meridian labs")).await.unwrap();
        assert!(memory.embedding.is_some());

        let patched = engine
            .patch(
                "u1",
                &memory.id,
                MemoryPatch {
                    content: Some("i work at northwind research".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(patched.content, "i work at northwind research");
        assert!(patched.embedding.is_none());

        // Content update leaves a backlog item for re-embedding
        let pending = engine
            .storage()
            .with_read(|conn| queries::pending_embeddings(conn, 10))
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].memory_id, memory.id);
    }

    #[tokio::test]
    async fn patch_delete_hides_from_list_and_fts() {
        let engine = engine_without_embedder();
        let (memory, _) = engine.save(save_input("my favorite color is blue")).await.unwrap();

        engine
            .patch(
                "u1",
                &memory.id,
                MemoryPatch {
                    deleted: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let (rows, _) = engine.list("u1", &ListOptions { limit: 10, ..Default::default() }).unwrap();
        assert!(rows.is_empty());
        let has = engine
            .storage()
            .with_read(|conn| queries::fts_has(conn, &memory.id))
            .unwrap();
        assert!(!has);
    }

    #[tokio::test]
    async fn patch_foreign_user_is_not_found() {
        let engine = engine_without_embedder();
        let (memory, _) = engine.save(save_input("my favorite color is blue")).await.unwrap();

        let err = engine
            .patch("intruder", &memory.id, MemoryPatch { priority: Some(0.1), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, MnemoError::NotFound(_)));
    }

    #[tokio::test]
    async fn observe_in_thread_bumps_counters() {
        let engine = engine_without_embedder();
        let (memory, _) = engine.save(save_input("i prefer dark roast coffee")).await.unwrap();

        let observed = engine.observe_in_thread("u1", &memory.id, "t9").await.unwrap();
        assert_eq!(observed.repeats, 2);
        assert!(observed.thread_set.contains(&"t9".to_string()));
        assert!(observed.last_seen_at >= memory.last_seen_at);
    }
}
