//! Core types for Mnemo

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a memory (opaque, globally unique)
pub type MemoryId = String;

/// Maximum stored content length in characters
pub const MAX_CONTENT_CHARS: usize = 1024;

/// Retention tier for a memory
///
/// - `T1`: cross-thread-worthy identity and durable facts
/// - `T2`: preferences and goals
/// - `T3`: general observations (default)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    T1,
    T2,
    #[default]
    T3,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::T1 => "t1",
            Tier::T2 => "t2",
            Tier::T3 => "t3",
        }
    }

    /// Time-to-live in days before soft deletion
    pub fn ttl_days(&self) -> i64 {
        match self {
            Tier::T1 => 120,
            Tier::T2 => 365,
            Tier::T3 => 90,
        }
    }

    /// Priority decay applied per full week of age
    pub fn weekly_decay(&self) -> f32 {
        match self {
            Tier::T1 => 0.01,
            Tier::T2 => 0.005,
            Tier::T3 => 0.02,
        }
    }

    /// Priority floor below which the memory is demoted (None = no demotion)
    pub fn demotion_floor(&self) -> Option<f32> {
        match self {
            Tier::T1 => Some(0.35),
            Tier::T2 => Some(0.50),
            Tier::T3 => None,
        }
    }

    /// Ordering rank for tie-breaks (T1 ranks highest)
    pub fn rank(&self) -> u8 {
        match self {
            Tier::T1 => 0,
            Tier::T2 => 1,
            Tier::T3 => 2,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "t1" => Ok(Tier::T1),
            "t2" => Ok(Tier::T2),
            "t3" => Ok(Tier::T3),
            _ => Err(format!("Unknown tier: {}", s)),
        }
    }
}

/// A stored memory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub id: MemoryId,
    pub user_id: String,
    /// Thread the memory currently belongs to
    pub thread_id: String,
    /// Content, stored after redaction
    pub content: String,
    /// Optional extracted entity list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entities: Option<Vec<String>>,
    /// Priority in [0, 1]
    pub priority: f32,
    /// Confidence in [0, 1]
    pub confidence: f32,
    /// Reversible placeholder -> original mapping, if the content had PII
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redaction_map: Option<HashMap<String, String>>,
    #[serde(default)]
    pub tier: Tier,
    /// Thread the memory was first observed in
    pub source_thread_id: String,
    /// Times this fact was observed (>= 1)
    pub repeats: i64,
    /// Threads the fact was observed in
    #[serde(default)]
    pub thread_set: Vec<String>,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Embedding vector of dimension D, not serialized on the wire
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_updated_at: Option<DateTime<Utc>>,
    /// Weeks of decay already applied since `updated_at`. Reset to zero by
    /// any mutation that bumps `updated_at`, so a retention pass is
    /// idempotent within a week.
    #[serde(skip)]
    pub decayed_weeks: i64,
}

impl Memory {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// One audit run over a thread window (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryAudit {
    pub id: String,
    pub user_id: String,
    pub thread_id: String,
    pub start_msg_id: Option<String>,
    pub end_msg_id: Option<String>,
    pub token_count: i64,
    /// Mean quality score over the audited turns
    pub score: f32,
    /// Memories saved by this audit
    pub saved: i64,
    pub created_at: DateTime<Utc>,
}

/// Optional LLM-produced summary for a thread
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub thread_id: String,
    pub user_id: String,
    pub summary: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
}

/// Persistent embedding backlog row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingQueueItem {
    pub id: String,
    pub memory_id: MemoryId,
    pub content: String,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Role of a chat turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Token counts reported by the gateway for one message
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input: i64,
    #[serde(default)]
    pub output: i64,
}

/// A message event forwarded by the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub user_id: String,
    pub thread_id: String,
    pub msg_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub tokens: TokenUsage,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Input for saving a memory through the engine
#[derive(Debug, Clone)]
pub struct SaveMemoryInput {
    pub user_id: String,
    pub thread_id: String,
    /// Raw content; the engine redacts before persisting
    pub content: String,
    pub priority: Option<f32>,
    pub tier: Option<Tier>,
    pub confidence: Option<f32>,
    pub entities: Option<Vec<String>>,
    /// True for `POST /memories` saves, false for audit-path saves.
    /// Explicit saves default to T1 and may override tier on supercede.
    pub explicit: bool,
}

impl SaveMemoryInput {
    pub fn explicit(user_id: impl Into<String>, thread_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            thread_id: thread_id.into(),
            content: content.into(),
            priority: None,
            tier: None,
            confidence: None,
            entities: None,
            explicit: true,
        }
    }
}

/// Outcome of a save: a fresh row or a supercede of an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveOutcome {
    Created,
    Superceded,
}

/// Patch applied to an existing memory
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryPatch {
    pub content: Option<String>,
    pub priority: Option<f32>,
    pub deleted: Option<bool>,
}

impl MemoryPatch {
    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.priority.is_none() && self.deleted.is_none()
    }
}

/// Options for listing memories
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub thread_id: Option<String>,
    pub min_priority: Option<f32>,
    pub include_deleted: bool,
    pub limit: i64,
    pub offset: i64,
}

/// Synonym expansion mode for recall
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExpansionMode {
    /// No expansion, keyword overlap required
    Strict,
    #[default]
    Normal,
    Aggressive,
}

impl ExpansionMode {
    /// Minimum cosine similarity for the semantic pass
    pub fn semantic_threshold(&self) -> f32 {
        match self {
            ExpansionMode::Strict => 0.85,
            ExpansionMode::Normal => 0.75,
            ExpansionMode::Aggressive => 0.65,
        }
    }

    /// (semantic, keyword) weights for hybrid scoring
    pub fn hybrid_weights(&self) -> (f32, f32) {
        match self {
            ExpansionMode::Strict => (0.4, 0.6),
            ExpansionMode::Normal => (0.6, 0.4),
            ExpansionMode::Aggressive => (0.8, 0.2),
        }
    }
}

impl std::str::FromStr for ExpansionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(ExpansionMode::Strict),
            "normal" => Ok(ExpansionMode::Normal),
            "aggressive" => Ok(ExpansionMode::Aggressive),
            _ => Err(format!("Unknown expansion mode: {}", s)),
        }
    }
}

/// Which search paths contributed to a recall response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    Hybrid,
    Keyword,
}

/// A recall request, with bounds already clamped
#[derive(Debug, Clone)]
pub struct RecallRequest {
    pub user_id: String,
    pub thread_id: Option<String>,
    pub query: Option<String>,
    pub max_items: usize,
    pub deadline_ms: u64,
    pub mode: ExpansionMode,
}

impl RecallRequest {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            thread_id: None,
            query: None,
            max_items: 5,
            deadline_ms: 200,
            mode: ExpansionMode::Normal,
        }
    }

    /// Clamp `maxItems` to [1, 20] and `deadlineMs` to [1, 500]
    pub fn clamped(mut self) -> Self {
        self.max_items = self.max_items.clamp(1, 20);
        self.deadline_ms = self.deadline_ms.clamp(1, 500);
        self
    }
}

/// One recalled memory with its final combined score
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecalledMemory {
    pub memory: Memory,
    pub score: f32,
}

/// Response of the recall engine
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallResponse {
    pub memories: Vec<RecalledMemory>,
    pub count: usize,
    pub elapsed_ms: u64,
    pub timed_out: bool,
    pub search_type: SearchType,
}

impl RecallResponse {
    pub fn empty(search_type: SearchType, elapsed_ms: u64, timed_out: bool) -> Self {
        Self {
            memories: Vec::new(),
            count: 0,
            elapsed_ms,
            timed_out,
            search_type,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database (":memory:" for tests)
    pub db_path: String,
    /// Number of read connections in the pool
    #[serde(default = "default_read_pool")]
    pub read_pool_size: usize,
}

fn default_read_pool() -> usize {
    4
}

impl StorageConfig {
    pub fn in_memory() -> Self {
        Self {
            db_path: ":memory:".to_string(),
            read_pool_size: 0,
        }
    }
}

/// Embedding provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    /// OpenAI-compatible endpoint base URL (None = embeddings disabled)
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    /// Vector dimension D, fixed at service start
    pub dimensions: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    100
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
            batch_size: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_round_trip() {
        for tier in [Tier::T1, Tier::T2, Tier::T3] {
            assert_eq!(tier.as_str().parse::<Tier>().unwrap(), tier);
        }
        assert!("t9".parse::<Tier>().is_err());
    }

    #[test]
    fn recall_request_clamps_bounds() {
        let req = RecallRequest {
            max_items: 500,
            deadline_ms: 90_000,
            ..RecallRequest::new("u1")
        }
        .clamped();
        assert_eq!(req.max_items, 20);
        assert_eq!(req.deadline_ms, 500);

        let req = RecallRequest {
            max_items: 0,
            deadline_ms: 0,
            ..RecallRequest::new("u1")
        }
        .clamped();
        assert_eq!(req.max_items, 1);
        assert_eq!(req.deadline_ms, 1);
    }

    #[test]
    fn expansion_mode_profiles() {
        assert_eq!(ExpansionMode::Strict.hybrid_weights(), (0.4, 0.6));
        assert_eq!(ExpansionMode::Aggressive.semantic_threshold(), 0.65);
        assert_eq!("AGGRESSIVE".parse::<ExpansionMode>().unwrap(), ExpansionMode::Aggressive);
    }
}
