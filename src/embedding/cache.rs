//! Short-lived embedding cache keyed by content hash
//!
//! Backed by the host KV capability; entries expire after one hour.
//! A cache miss is always recoverable, so KV failures never surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::providers::KvStore;

/// Cache entry lifetime
pub const CACHE_TTL: Duration = Duration::from_secs(3600);

/// Hit/miss counters for the metrics surface
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

pub struct EmbeddingCache {
    kv: Arc<dyn KvStore>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn key(text: &str) -> String {
        let digest = Sha256::digest(text.as_bytes());
        format!("emb:{}", hex::encode(digest))
    }

    pub async fn get(&self, text: &str) -> Option<Vec<f32>> {
        let cached = self.kv.get(&Self::key(text)).await;
        match cached.and_then(|raw| serde_json::from_str::<Vec<f32>>(&raw).ok()) {
            Some(vector) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(vector)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn put(&self, text: &str, vector: &[f32]) {
        if let Ok(raw) = serde_json::to_string(vector) {
            self.kv.set(&Self::key(text), raw, Some(CACHE_TTL)).await;
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
