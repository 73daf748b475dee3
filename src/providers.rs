//! Host-provided capability traits
//!
//! The memory core consumes these interfaces; the host environment (or the
//! server binary) supplies implementations. Only the embedding provider has
//! a real client in this crate (see [`crate::embedding`]); everything else
//! ships with either an in-process stand-in or nothing at all.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;

/// LLM text completion, used only for optional thread summaries
#[async_trait]
pub trait TextCompletion: Send + Sync {
    async fn complete(&self, system: &str, user: &str, max_tokens: usize) -> Result<String>;
}

/// Best-effort key/value store for caches
///
/// A miss is always recoverable; implementations must never surface
/// transient failures as errors on the read path.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>);
    async fn del(&self, key: &str);
    async fn exists(&self, key: &str) -> bool;
}

/// Durable publish channel for research capsules
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<()>;
}

/// External web search, consumed by the out-of-scope research pipeline
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, freshness: Option<&str>, count: usize) -> Result<Vec<serde_json::Value>>;
}

/// In-process TTL key/value store
///
/// Default backing for the embedding and profile caches when no external
/// KV is wired in. Expired entries are dropped lazily on access.
pub struct MemoryKv {
    entries: DashMap<String, KvEntry>,
}

struct KvEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Option<String> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Some(entry.value.clone());
            }
        }
        // Drop expired entries on the way out
        self.entries.remove_if(key, |_, e| e.is_expired());
        None
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
    }

    async fn del(&self, key: &str) {
        self.entries.remove(key);
    }

    async fn exists(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }
}
