//! Deadline-bounded hybrid recall
//!
//! Combines a semantic pass (cosine over stored vectors) with a keyword
//! pass (FTS5, falling back to scanning recent rows) under a hard budget.
//! Stage boundaries check the deadline and return whatever is complete;
//! recall never mutates the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::embedding::{cosine_similarity, EmbeddingService};
use crate::engine::topics;
use crate::query::{preprocess, ProcessedQuery};
use crate::storage::{queries, Storage};
use crate::types::{
    Memory, RecallRequest, RecallResponse, RecalledMemory, SearchType,
};

/// Bound on candidates for the semantic pass
const SEMANTIC_CANDIDATES: i64 = 100;
/// Bound on rows scanned by the LIKE fallback
const FALLBACK_CANDIDATES: i64 = 500;
/// Cosine threshold for post-ranking semantic dedup
pub const SEMANTIC_DEDUP_THRESHOLD: f32 = 0.85;

struct Scored {
    memory: Memory,
    semantic: f32,
    keyword: f32,
    combined: f32,
}

pub struct RecallEngine {
    storage: Storage,
    embeddings: Arc<EmbeddingService>,
}

impl RecallEngine {
    pub fn new(storage: Storage, embeddings: Arc<EmbeddingService>) -> Self {
        Self { storage, embeddings }
    }

    /// Run a recall under its deadline. On expiry returns whatever was
    /// complete, with `timed_out` set.
    pub async fn recall(&self, request: RecallRequest) -> RecallResponse {
        let request = request.clamped();
        let started = Instant::now();
        let budget = Duration::from_millis(request.deadline_ms);

        // Outer backstop; the stages also poll the deadline cooperatively
        match tokio::time::timeout(budget, self.recall_inner(&request, started, budget)).await {
            Ok(response) => response,
            Err(_) => {
                let elapsed = started.elapsed().as_millis() as u64;
                tracing::warn!(user_id = %request.user_id, elapsed, "Recall hit hard deadline");
                RecallResponse::empty(SearchType::Keyword, elapsed, true)
            }
        }
    }

    async fn recall_inner(&self, request: &RecallRequest, started: Instant, budget: Duration) -> RecallResponse {
        let expired = || started.elapsed() >= budget;
        let elapsed_ms = || started.elapsed().as_millis() as u64;

        let query_text = request.query.as_deref().unwrap_or("").trim();
        if query_text.is_empty() {
            return self.browse(request, started);
        }

        let pq = preprocess(query_text, request.mode);

        // Query embedding; failures degrade silently to keyword-only
        let mut search_type = SearchType::Keyword;
        let query_embedding = if self.embeddings.is_configured() && !expired() {
            self.embeddings.generate(&pq.normalized).await.ok().flatten()
        } else {
            None
        };

        let candidate_cap = (request.max_items * 2) as i64;
        let mut merged: HashMap<String, Scored> = HashMap::new();

        // Semantic pass
        if let Some(ref vector) = query_embedding {
            if !expired() {
                search_type = SearchType::Hybrid;
                let threshold = request.mode.semantic_threshold();
                let candidates = self
                    .storage
                    .with_read(|conn| {
                        queries::live_memories_with_embeddings(conn, &request.user_id, SEMANTIC_CANDIDATES)
                    })
                    .unwrap_or_default();

                let mut scored: Vec<(f32, Memory)> = candidates
                    .into_iter()
                    .filter_map(|m| {
                        let similarity = m.embedding.as_deref().map(|e| cosine_similarity(e, vector))?;
                        (similarity >= threshold).then_some((similarity, m))
                    })
                    .collect();
                scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
                scored.truncate(candidate_cap as usize);

                for (similarity, memory) in scored {
                    merged.insert(
                        memory.id.clone(),
                        Scored {
                            memory,
                            semantic: similarity,
                            keyword: 0.0,
                            combined: 0.0,
                        },
                    );
                }
            }
        }

        // Keyword pass
        if !expired() {
            for memory in self.keyword_pass(&request.user_id, &pq, candidate_cap) {
                let score = keyword_score(&memory.content, &pq);
                if score <= 0.0 {
                    continue;
                }
                merged
                    .entry(memory.id.clone())
                    .and_modify(|s| s.keyword = score)
                    .or_insert(Scored {
                        memory,
                        semantic: 0.0,
                        keyword: score,
                        combined: 0.0,
                    });
            }
        }

        // Weighted merge plus re-ranking boosts, capped at 1.0
        let (w_sem, w_kw) = request.mode.hybrid_weights();
        let now = Utc::now();
        for scored in merged.values_mut() {
            let base = scored.semantic * w_sem + scored.keyword * w_kw;
            let content = scored.memory.content.to_lowercase();
            let boost = phrase_boost(&content, &pq)
                * position_boost(&content, &pq)
                * tier_boost(&scored.memory)
                * priority_boost(scored.memory.priority)
                * recency_boost(&scored.memory, now);
            scored.combined = (base * boost).min(1.0);
        }

        let mut results: Vec<Scored> = merged.into_values().collect();
        sort_results(&mut results, now);

        // Strict mode drops anything the query terms never touched
        if request.mode == crate::types::ExpansionMode::Strict {
            results.retain(|s| has_term_overlap(&s.memory.content.to_lowercase(), &pq));
        }

        // Unfinished statements never reach the caller
        results.retain(|s| !topics::is_incomplete(&s.memory.content));

        let timed_out = expired();
        if !timed_out {
            results = dedup_by_topic(results);
            results = dedup_by_embedding(results);
        }

        results.truncate(request.max_items);
        RecallResponse {
            count: results.len(),
            memories: results
                .into_iter()
                .map(|s| RecalledMemory {
                    memory: s.memory,
                    score: s.combined,
                })
                .collect(),
            elapsed_ms: elapsed_ms(),
            timed_out,
            search_type,
        }
    }

    /// Query-less recall: highest-priority live memories
    fn browse(&self, request: &RecallRequest, started: Instant) -> RecallResponse {
        let rows = self
            .storage
            .with_read(|conn| queries::top_memories_by_priority(conn, &request.user_id, (request.max_items * 2) as i64))
            .unwrap_or_default();

        let memories: Vec<RecalledMemory> = rows
            .into_iter()
            .filter(|m| !topics::is_incomplete(&m.content))
            .take(request.max_items)
            .map(|memory| {
                let score = memory.priority;
                RecalledMemory { memory, score }
            })
            .collect();

        RecallResponse {
            count: memories.len(),
            memories,
            elapsed_ms: started.elapsed().as_millis() as u64,
            timed_out: false,
            search_type: SearchType::Keyword,
        }
    }

    /// FTS5 first; on error or empty, scan recent rows with the same
    /// term weighting
    fn keyword_pass(&self, user_id: &str, pq: &ProcessedQuery, limit: i64) -> Vec<Memory> {
        let fts_query = pq.fts_query();
        if !fts_query.is_empty() {
            let hits = self
                .storage
                .with_read(|conn| queries::fts_search(conn, user_id, &fts_query, limit * 2));
            match hits {
                Ok(rows) if !rows.is_empty() => {
                    let mut memories = Vec::with_capacity(rows.len());
                    for (id, _rank) in rows {
                        if let Ok(Some(memory)) =
                            self.storage.with_read(|conn| queries::get_memory(conn, user_id, &id))
                        {
                            if memory.is_live() {
                                memories.push(memory);
                            }
                        }
                    }
                    return memories;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "FTS query failed, falling back to scan");
                }
            }
        }

        self.storage
            .with_read(|conn| queries::recent_live_memories(conn, user_id, FALLBACK_CANDIDATES))
            .unwrap_or_default()
    }
}

/// Relevance over query terms: an exact phrase counts double, a phrase
/// whose words appear scattered earns proportional credit
fn keyword_score(content: &str, pq: &ProcessedQuery) -> f32 {
    let content = content.to_lowercase();
    let denominator = (2 * pq.phrases.len() + pq.keywords.len() + pq.synonyms.len()) as f32;
    if denominator == 0.0 {
        return 0.0;
    }

    let mut hits = 0.0f32;
    for phrase in &pq.phrases {
        if content.contains(phrase.as_str()) {
            hits += 2.0;
        } else {
            let words: Vec<&str> = phrase.split_whitespace().collect();
            let present = words.iter().filter(|w| content.contains(**w)).count();
            if present > 0 {
                hits += 1.5 * present as f32 / words.len() as f32;
            }
        }
    }
    for term in pq.keywords.iter().chain(pq.synonyms.iter()) {
        if content.contains(term.as_str()) {
            hits += 1.0;
        }
    }
    hits / denominator
}

/// Does the memory share a phrase or an original keyword with the query?
fn has_term_overlap(content: &str, pq: &ProcessedQuery) -> bool {
    pq.phrases.iter().any(|p| content.contains(p.as_str()))
        || pq.keywords.iter().any(|k| content.contains(k.as_str()))
}

/// Exact phrase 2x, all words present 1.5x, half the words 1.2x
fn phrase_boost(content: &str, pq: &ProcessedQuery) -> f32 {
    let mut best = 1.0f32;
    for phrase in &pq.phrases {
        let boost = if content.contains(phrase.as_str()) {
            2.0
        } else {
            let words: Vec<&str> = phrase.split_whitespace().collect();
            let present = words.iter().filter(|w| content.contains(**w)).count();
            if present == words.len() {
                1.5
            } else if present * 2 >= words.len() {
                1.2
            } else {
                1.0
            }
        };
        best = best.max(boost);
    }
    best
}

/// Early keyword occurrences rank higher; averaged over matched keywords
fn position_boost(content: &str, pq: &ProcessedQuery) -> f32 {
    let length = content.chars().count().max(1) as f32;
    let mut boosts: Vec<f32> = Vec::new();
    for keyword in &pq.keywords {
        if let Some(byte_pos) = content.find(keyword.as_str()) {
            let position = content[..byte_pos].chars().count() as f32 / length;
            boosts.push(if position < 0.25 {
                1.5
            } else if position < 0.5 {
                1.2
            } else {
                1.0
            });
        }
    }
    if boosts.is_empty() {
        1.0
    } else {
        boosts.iter().sum::<f32>() / boosts.len() as f32
    }
}

fn tier_boost(memory: &Memory) -> f32 {
    match memory.tier {
        crate::types::Tier::T1 => 1.2,
        crate::types::Tier::T2 => 1.1,
        crate::types::Tier::T3 => 1.0,
    }
}

fn priority_boost(priority: f32) -> f32 {
    if priority >= 0.9 {
        1.2
    } else if priority >= 0.8 {
        1.1
    } else if priority >= 0.7 {
        1.05
    } else {
        1.0
    }
}

fn recency_boost(memory: &Memory, now: chrono::DateTime<Utc>) -> f32 {
    let age = now - memory.updated_at;
    if age < chrono::Duration::hours(24) {
        1.1
    } else if age < chrono::Duration::days(7) {
        1.05
    } else {
        1.0
    }
}

/// Deterministic order: combined desc, last-24h first, updated_at desc,
/// tier, priority desc
fn sort_results(results: &mut [Scored], now: chrono::DateTime<Utc>) {
    results.sort_by(|a, b| {
        b.combined
            .partial_cmp(&a.combined)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let a_recent = now - a.memory.updated_at < chrono::Duration::hours(24);
                let b_recent = now - b.memory.updated_at < chrono::Duration::hours(24);
                b_recent.cmp(&a_recent)
            })
            .then_with(|| b.memory.updated_at.cmp(&a.memory.updated_at))
            .then_with(|| a.memory.tier.rank().cmp(&b.memory.tier.rank()))
            .then_with(|| {
                b.memory
                    .priority
                    .partial_cmp(&a.memory.priority)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    });
}

/// Keep one memory per detected topic, chosen by the keep rules
fn dedup_by_topic(results: Vec<Scored>) -> Vec<Scored> {
    let mut kept: Vec<Scored> = Vec::new();
    let mut topic_slots: HashMap<String, usize> = HashMap::new();

    for scored in results {
        match topics::detect_topic(&scored.memory.content) {
            Some(topic) => match topic_slots.get(&topic) {
                Some(&slot) => {
                    let winner_is_new =
                        topics::should_keep(&kept[slot].memory, &scored.memory).id == scored.memory.id;
                    if winner_is_new {
                        kept[slot] = scored;
                    }
                }
                None => {
                    topic_slots.insert(topic, kept.len());
                    kept.push(scored);
                }
            },
            None => kept.push(scored),
        }
    }
    kept
}

/// Collapse near-identical vectors among the survivors
fn dedup_by_embedding(results: Vec<Scored>) -> Vec<Scored> {
    let mut kept: Vec<Scored> = Vec::new();
    for scored in results {
        let mut duplicate_of: Option<usize> = None;
        if let Some(ref embedding) = scored.memory.embedding {
            for (i, existing) in kept.iter().enumerate() {
                if let Some(ref other) = existing.memory.embedding {
                    if cosine_similarity(embedding, other) >= SEMANTIC_DEDUP_THRESHOLD {
                        duplicate_of = Some(i);
                        break;
                    }
                }
            }
        }
        match duplicate_of {
            Some(i) => {
                if topics::should_keep(&kept[i].memory, &scored.memory).id == scored.memory.id {
                    kept[i] = scored;
                }
            }
            None => kept.push(scored),
        }
    }
    kept
}
