//! Embedding generation with cache, backlog queue and background worker
//!
//! The provider is a host capability; when it is absent or failing, writes
//! queue their content in the persistent backlog and recall degrades to
//! keyword-only. Vectors are validated against the fixed dimension D.

mod cache;
mod worker;

pub use cache::EmbeddingCache;
pub use worker::EmbeddingWorker;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{MnemoError, Result};
use crate::providers::KvStore;
use crate::storage::{queries, Storage};
use crate::types::{EmbeddingSettings, Memory};

/// Host capability: turns text into fixed-dimension vectors
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// One provider call for the whole batch; a None slot means the
    /// provider could not embed that input.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>>;

    fn dimensions(&self) -> usize;

    fn model_name(&self) -> &str;
}

/// OpenAI-compatible embeddings client
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
}

impl HttpEmbedder {
    pub fn new(base_url: String, api_key: Option<String>, model: String, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            dimensions,
        }
    }

    async fn call(&self, inputs: &[&str]) -> Result<Vec<Option<Vec<f32>>>> {
        let mut request = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&serde_json::json!({
                "input": inputs,
                "model": self.model,
            }));
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MnemoError::Provider(format!(
                "embedding endpoint returned {status}: {body}"
            )));
        }

        let data: serde_json::Value = response.json().await?;
        let rows = data["data"]
            .as_array()
            .ok_or_else(|| MnemoError::Embedding("invalid response format".to_string()))?;

        let vectors = rows
            .iter()
            .map(|item| {
                item["embedding"].as_array().map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_f64().map(|f| f as f32))
                        .collect::<Vec<f32>>()
                })
            })
            .collect();
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.call(&[text]).await?;
        vectors
            .pop()
            .flatten()
            .ok_or_else(|| MnemoError::Embedding("empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let refs: Vec<&str> = texts.iter().map(|s| s.as_str()).collect();
        self.call(&refs).await
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Build the provider from settings; None disables embeddings
pub fn create_provider(settings: &EmbeddingSettings) -> Option<Arc<dyn EmbeddingProvider>> {
    settings.base_url.as_ref().map(|base_url| {
        Arc::new(HttpEmbedder::new(
            base_url.clone(),
            settings.api_key.clone(),
            settings.model.clone(),
            settings.dimensions,
        )) as Arc<dyn EmbeddingProvider>
    })
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Cache-first embedding generation for the hot paths
pub struct EmbeddingService {
    provider: Option<Arc<dyn EmbeddingProvider>>,
    cache: EmbeddingCache,
    dimensions: usize,
}

impl EmbeddingService {
    pub fn new(provider: Option<Arc<dyn EmbeddingProvider>>, kv: Arc<dyn KvStore>, dimensions: usize) -> Self {
        Self {
            provider,
            cache: EmbeddingCache::new(kv),
            dimensions,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.provider.is_some()
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    fn validate(&self, vector: Vec<f32>) -> Result<Vec<f32>> {
        if vector.len() != self.dimensions {
            return Err(MnemoError::Embedding(format!(
                "provider returned dimension {} (expected {})",
                vector.len(),
                self.dimensions
            )));
        }
        Ok(vector)
    }

    /// Generate one embedding. Ok(None) when no provider is configured.
    pub async fn generate(&self, text: &str) -> Result<Option<Vec<f32>>> {
        let Some(ref provider) = self.provider else {
            return Ok(None);
        };

        if let Some(cached) = self.cache.get(text).await {
            return Ok(Some(cached));
        }

        let vector = self.validate(provider.embed(text).await?)?;
        self.cache.put(text, &vector).await;
        Ok(Some(vector))
    }

    /// Batch generation: cache-first, one provider call for the misses
    pub async fn generate_batch(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        let Some(ref provider) = self.provider else {
            return Ok(vec![None; texts.len()]);
        };

        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses: Vec<usize> = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            match self.cache.get(text).await {
                Some(cached) => out[i] = Some(cached),
                None => misses.push(i),
            }
        }
        if misses.is_empty() {
            return Ok(out);
        }

        let miss_texts: Vec<String> = misses.iter().map(|&i| texts[i].clone()).collect();
        let vectors = provider.embed_batch(&miss_texts).await?;
        for (slot, vector) in misses.into_iter().zip(vectors.into_iter()) {
            if let Some(v) = vector {
                if v.len() == self.dimensions {
                    self.cache.put(&texts[slot], &v).await;
                    out[slot] = Some(v);
                } else {
                    tracing::warn!(
                        got = v.len(),
                        expected = self.dimensions,
                        "Dropping embedding with wrong dimension"
                    );
                }
            }
        }
        Ok(out)
    }

    /// Prefer the stored vector; otherwise generate now, and on failure or
    /// absence of a provider queue the memory for the background worker.
    pub async fn get_or_generate(&self, storage: &Storage, memory: &Memory) -> Option<Vec<f32>> {
        if let Some(ref existing) = memory.embedding {
            return Some(existing.clone());
        }

        match self.generate(&memory.content).await {
            Ok(Some(vector)) => {
                let result = storage.with_transaction(|conn| {
                    queries::set_embedding(conn, &memory.id, &vector, Utc::now())
                });
                if let Err(e) = result {
                    tracing::warn!(memory_id = %memory.id, error = %e, "Failed to persist embedding");
                }
                Some(vector)
            }
            Ok(None) | Err(_) => {
                let queued = storage.with_write(|conn| {
                    queries::enqueue_embedding(conn, &memory.id, &memory.content, Utc::now())
                });
                if let Err(e) = queued {
                    tracing::warn!(memory_id = %memory.id, error = %e, "Failed to queue embedding");
                }
                None
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::StubEmbedder;
    use super::*;
    use crate::providers::MemoryKv;

    #[test]
    fn cosine_basics() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &[1.0, 0.0, 0.0]) - 1.0).abs() < 0.001);
        assert!(cosine_similarity(&a, &[0.0, 1.0, 0.0]).abs() < 0.001);
        assert_eq!(cosine_similarity(&a, &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn generate_uses_cache_on_second_call() {
        let embedder = Arc::new(StubEmbedder::new(16));
        let service = EmbeddingService::new(Some(embedder.clone()), Arc::new(MemoryKv::new()), 16);

        let first = service.generate("i like rust").await.unwrap().unwrap();
        let second = service.generate("i like rust").await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(*embedder.calls.lock(), 1);
    }

    #[tokio::test]
    async fn generate_without_provider_is_none() {
        let service = EmbeddingService::new(None, Arc::new(MemoryKv::new()), 16);
        assert!(service.generate("anything").await.unwrap().is_none());
        assert!(!service.is_configured());
    }

    #[tokio::test]
    async fn batch_only_calls_provider_for_misses() {
        let embedder = Arc::new(StubEmbedder::new(16));
        let service = EmbeddingService::new(Some(embedder.clone()), Arc::new(MemoryKv::new()), 16);

        service.generate("alpha").await.unwrap();
        let out = service
            .generate_batch(&["alpha".to_string(), "beta".to_string()])
            .await
            .unwrap();
        assert!(out.iter().all(|v| v.is_some()));
        // One single call plus one batch call
        assert_eq!(*embedder.calls.lock(), 2);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_an_error() {
        let embedder = Arc::new(StubEmbedder::new(8));
        let service = EmbeddingService::new(Some(embedder), Arc::new(MemoryKv::new()), 16);
        assert!(service.generate("text").await.is_err());
    }
}
