//! Per-user profile aggregation
//!
//! Builds a coarse profile from the user's tier-1/2 memories: tech stack
//! ranked by summed priority, domain interests, an expertise estimate and
//! a communication-style hint. Cached for an hour and persisted as the
//! serialized `user_profiles` row; invalidated whenever a T1/T2 memory is
//! saved or superceded.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::providers::KvStore;
use crate::storage::{queries, Storage};
use crate::types::Tier;

/// Profile cache lifetime
pub const PROFILE_CACHE_TTL: Duration = Duration::from_secs(3600);
/// Memories read per build
const PROFILE_INPUT_LIMIT: i64 = 100;
/// Minimum memories before a communication style is inferred
const STYLE_MIN_MEMORIES: usize = 3;

/// KV key for a user's cached profile
pub fn cache_key(user_id: &str) -> String {
    format!("profile:{user_id}")
}

static TECH_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("rust", r"\brust\b|\bcargo\b"),
        ("python", r"\bpython\b|\bpip\b|\bdjango\b|\bflask\b"),
        ("typescript", r"\btypescript\b|\bts\b"),
        ("javascript", r"\bjavascript\b|\bnode(?:js)?\b"),
        ("go", r"\bgolang\b|\bgo\b"),
        ("react", r"\breact\b|\bnext\.?js\b"),
        ("postgres", r"\bpostgres(?:ql)?\b"),
        ("sqlite", r"\bsqlite\b"),
        ("redis", r"\bredis\b"),
        ("kubernetes", r"\bkubernetes\b|\bk8s\b"),
        ("docker", r"\bdocker\b|\bcontainers?\b"),
        ("aws", r"\baws\b|\bs3\b|\blambda\b"),
        ("terraform", r"\bterraform\b"),
        ("kafka", r"\bkafka\b"),
        ("graphql", r"\bgraphql\b"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(&format!("(?i){pattern}")).unwrap()))
    .collect()
});

static DOMAIN_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("web development", r"\bweb\b|\bfrontend\b|\bbackend\b"),
        ("machine learning", r"\bmachine learning\b|\bml\b|\bllm\b|\bmodels?\b"),
        ("data engineering", r"\bdata\b|\bpipelines?\b|\betl\b"),
        ("devops", r"\bdevops\b|\bdeploy\b|\binfra(?:structure)?\b|\bci/?cd\b"),
        ("security", r"\bsecurity\b|\bauth\b|\bencryption\b"),
        ("gaming", r"\bgames?\b|\bgaming\b"),
        ("music", r"\bmusic\b|\bguitar\b|\bpiano\b"),
        ("cooking", r"\bcooking\b|\brecipes?\b|\bbaking\b"),
        ("fitness", r"\bfitness\b|\bgym\b|\brunning\b|\bcycling\b"),
        ("photography", r"\bphotography\b|\bcameras?\b"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(&format!("(?i){pattern}")).unwrap()))
    .collect()
});

static EXPERT_CUES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "architecture",
        "optimize",
        "performance",
        "benchmark",
        "internals",
        "concurrency",
        "distributed",
        "profiling",
        "tradeoff",
        "production",
    ]
});

static BEGINNER_CUES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "how do i",
        "what is a",
        "tutorial",
        "beginner",
        "new to",
        "getting started",
        "learning",
        "first time",
    ]
});

static CONCISE_CUES: Lazy<Vec<&'static str>> =
    Lazy::new(|| vec!["brief", "short", "concise", "tldr", "to the point", "bullet"]);

static DETAILED_CUES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec!["detail", "thorough", "explain", "step by step", "in depth", "comprehensive"]
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpertiseLevel {
    Beginner,
    Intermediate,
    Expert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommunicationStyle {
    Concise,
    Detailed,
}

/// A ranked technology with its summed priority weight
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TechStackEntry {
    pub name: String,
    pub weight: f32,
}

/// Derived per-user profile
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: String,
    pub tech_stack: Vec<TechStackEntry>,
    /// Domain interests, inferred from T2 memories only
    pub domains: Vec<String>,
    pub expertise: ExpertiseLevel,
    pub communication_style: Option<CommunicationStyle>,
    /// T1/T2 memories the profile was built from
    pub memory_count: usize,
    pub last_updated: DateTime<Utc>,
}

pub struct ProfileBuilder {
    storage: Storage,
    kv: Arc<dyn KvStore>,
}

impl ProfileBuilder {
    pub fn new(storage: Storage, kv: Arc<dyn KvStore>) -> Self {
        Self { storage, kv }
    }

    /// Cached profile, building and persisting on miss.
    /// None iff the user has no live T1/T2 memories.
    pub async fn get_or_build(&self, user_id: &str) -> Result<Option<UserProfile>> {
        if let Some(raw) = self.kv.get(&cache_key(user_id)).await {
            if let Ok(profile) = serde_json::from_str::<UserProfile>(&raw) {
                return Ok(Some(profile));
            }
        }

        let Some(profile) = self.build(user_id)? else {
            return Ok(None);
        };

        let serialized = serde_json::to_string(&profile)?;
        self.kv
            .set(&cache_key(user_id), serialized.clone(), Some(PROFILE_CACHE_TTL))
            .await;
        self.storage
            .with_write(|conn| queries::upsert_profile(conn, user_id, &serialized, profile.last_updated))?;

        Ok(Some(profile))
    }

    /// Drop the cached profile so the next read rebuilds it
    pub async fn invalidate(&self, user_id: &str) {
        self.kv.del(&cache_key(user_id)).await;
    }

    fn build(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let memories = self
            .storage
            .with_read(|conn| queries::top_memories_by_priority(conn, user_id, PROFILE_INPUT_LIMIT))?;
        let relevant: Vec<_> = memories
            .into_iter()
            .filter(|m| m.tier != Tier::T3)
            .collect();
        if relevant.is_empty() {
            return Ok(None);
        }

        let mut tech_stack: Vec<TechStackEntry> = TECH_PATTERNS
            .iter()
            .filter_map(|(name, regex)| {
                let weight: f32 = relevant
                    .iter()
                    .filter(|m| regex.is_match(&m.content))
                    .map(|m| m.priority)
                    .sum();
                (weight > 0.0).then(|| TechStackEntry {
                    name: (*name).to_string(),
                    weight,
                })
            })
            .collect();
        tech_stack.sort_by(|a, b| b.weight.partial_cmp(&a.weight).unwrap_or(std::cmp::Ordering::Equal));
        tech_stack.truncate(8);

        let domains: Vec<String> = DOMAIN_PATTERNS
            .iter()
            .filter(|(_, regex)| {
                relevant
                    .iter()
                    .any(|m| m.tier == Tier::T2 && regex.is_match(&m.content))
            })
            .map(|(name, _)| (*name).to_string())
            .collect();

        let expertise = infer_expertise(&relevant);
        let communication_style = infer_style(&relevant);

        Ok(Some(UserProfile {
            user_id: user_id.to_string(),
            tech_stack,
            domains,
            expertise,
            communication_style,
            memory_count: relevant.len(),
            last_updated: Utc::now(),
        }))
    }
}

fn count_cues(memories: &[crate::types::Memory], cues: &[&str]) -> usize {
    memories
        .iter()
        .map(|m| {
            let lower = m.content.to_lowercase();
            cues.iter().filter(|cue| lower.contains(**cue)).count()
        })
        .sum()
}

fn infer_expertise(memories: &[crate::types::Memory]) -> ExpertiseLevel {
    let expert = count_cues(memories, &EXPERT_CUES) as f32;
    let beginner = count_cues(memories, &BEGINNER_CUES) as f32;
    let ratio = (expert - beginner) / memories.len() as f32;
    if ratio > 0.15 {
        ExpertiseLevel::Expert
    } else if ratio < -0.15 {
        ExpertiseLevel::Beginner
    } else {
        ExpertiseLevel::Intermediate
    }
}

fn infer_style(memories: &[crate::types::Memory]) -> Option<CommunicationStyle> {
    if memories.len() < STYLE_MIN_MEMORIES {
        return None;
    }
    let concise = count_cues(memories, &CONCISE_CUES);
    let detailed = count_cues(memories, &DETAILED_CUES);
    if concise > detailed && concise > 0 {
        Some(CommunicationStyle::Concise)
    } else if detailed > concise && detailed > 0 {
        Some(CommunicationStyle::Detailed)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MemoryKv;
    use crate::storage::queries::insert_memory;
    use crate::types::Memory;

    fn seed(storage: &Storage, tier: Tier, priority: f32, content: &str) {
        let now = Utc::now();
        let memory = Memory {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: "u1".to_string(),
            thread_id: "t1".to_string(),
            content: content.to_string(),
            entities: None,
            priority,
            confidence: 0.8,
            redaction_map: None,
            tier,
            source_thread_id: "t1".to_string(),
            repeats: 1,
            thread_set: vec!["t1".to_string()],
            last_seen_at: now,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            embedding: None,
            embedding_updated_at: None,
            decayed_weeks: 0,
        };
        storage.with_write(|conn| insert_memory(conn, &memory)).unwrap();
    }

    fn builder() -> (ProfileBuilder, Storage) {
        let storage = Storage::open_in_memory().unwrap();
        (ProfileBuilder::new(storage.clone(), Arc::new(MemoryKv::new())), storage)
    }

    #[tokio::test]
    async fn no_t1_t2_memories_means_no_profile() {
        let (builder, storage) = builder();
        seed(&storage, Tier::T3, 0.9, "i use rust every day");

        let profile = builder.get_or_build("u1").await.unwrap();
        assert!(profile.is_none());
    }

    #[tokio::test]
    async fn ranks_tech_stack_by_summed_priority() {
        let (builder, storage) = builder();
        seed(&storage, Tier::T1, 0.9, "i work mostly in rust these days");
        seed(&storage, Tier::T2, 0.6, "i prefer rust over go for services");
        seed(&storage, Tier::T2, 0.5, "i sometimes write python scripts");

        let profile = builder.get_or_build("u1").await.unwrap().unwrap();
        assert_eq!(profile.tech_stack[0].name, "rust");
        assert!(profile.tech_stack[0].weight > 1.4);
        assert!(profile.tech_stack.iter().any(|t| t.name == "python"));
        assert_eq!(profile.memory_count, 3);
    }

    #[tokio::test]
    async fn domains_come_from_t2_only() {
        let (builder, storage) = builder();
        seed(&storage, Tier::T1, 0.9, "i work on security infrastructure");
        seed(&storage, Tier::T2, 0.7, "i enjoy photography on weekends");

        let profile = builder.get_or_build("u1").await.unwrap().unwrap();
        assert!(profile.domains.contains(&"photography".to_string()));
        assert!(!profile.domains.contains(&"security".to_string()));
    }

    #[tokio::test]
    async fn style_needs_three_memories() {
        let (builder, storage) = builder();
        seed(&storage, Tier::T2, 0.7, "keep answers brief and concise please");
        seed(&storage, Tier::T2, 0.7, "short bullet lists work best for me");

        let profile = builder.get_or_build("u1").await.unwrap().unwrap();
        assert_eq!(profile.communication_style, None);

        seed(&storage, Tier::T2, 0.6, "tldr summaries are my preference");
        builder.invalidate("u1").await;
        let profile = builder.get_or_build("u1").await.unwrap().unwrap();
        assert_eq!(profile.communication_style, Some(CommunicationStyle::Concise));
    }

    #[tokio::test]
    async fn caches_and_persists() {
        let (builder, storage) = builder();
        seed(&storage, Tier::T1, 0.9, "i am a backend engineer using postgres");

        let first = builder.get_or_build("u1").await.unwrap().unwrap();
        // Second read hits the KV cache
        let second = builder.get_or_build("u1").await.unwrap().unwrap();
        assert_eq!(first.last_updated, second.last_updated);

        let stored = storage
            .with_read(|conn| queries::get_profile(conn, "u1"))
            .unwrap();
        assert!(stored.is_some());
    }
}
