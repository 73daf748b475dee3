//! SQL queries for memories, audits, summaries, profiles and the
//! embedding backlog
//!
//! The FTS index is synchronized explicitly from the mutation paths; the
//! canonical sync check is "is this memory_id already present in the FTS
//! table". All timestamps are RFC3339 text.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashMap;

use crate::error::Result;
use crate::types::{EmbeddingQueueItem, ListOptions, Memory, MemoryAudit, MemoryId, ThreadSummary, Tier};

/// Column list matching `memory_from_row`
pub const MEMORY_COLUMNS: &str = "id, user_id, thread_id, content, entities, priority, confidence, \
     redaction_map, tier, source_thread_id, repeats, thread_set, last_seen_at, \
     created_at, updated_at, deleted_at, embedding, embedding_updated_at, decayed_weeks";

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_ts)
}

/// Serialize an embedding as little-endian f32 bytes
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Deserialize an embedding blob; None when empty or misaligned
pub fn embedding_from_bytes(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return None;
    }
    let mut embedding = Vec::with_capacity(bytes.len() / 4);
    for chunk in bytes.chunks_exact(4) {
        let arr: [u8; 4] = chunk.try_into().expect("chunk of 4");
        embedding.push(f32::from_le_bytes(arr));
    }
    Some(embedding)
}

/// Map a row selected with [`MEMORY_COLUMNS`] to a [`Memory`]
pub fn memory_from_row(row: &Row) -> rusqlite::Result<Memory> {
    let entities: Option<String> = row.get(4)?;
    let redaction_map: Option<String> = row.get(7)?;
    let tier_str: String = row.get(8)?;
    let thread_set: String = row.get(11)?;
    let last_seen_at: String = row.get(12)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;
    let deleted_at: Option<String> = row.get(15)?;
    let embedding: Option<Vec<u8>> = row.get(16)?;
    let embedding_updated_at: Option<String> = row.get(17)?;

    Ok(Memory {
        id: row.get(0)?,
        user_id: row.get(1)?,
        thread_id: row.get(2)?,
        content: row.get(3)?,
        entities: entities.and_then(|s| serde_json::from_str(&s).ok()),
        priority: row.get(5)?,
        confidence: row.get(6)?,
        redaction_map: redaction_map.and_then(|s| serde_json::from_str(&s).ok()),
        tier: tier_str.parse().unwrap_or_default(),
        source_thread_id: row.get(9)?,
        repeats: row.get(10)?,
        thread_set: serde_json::from_str(&thread_set).unwrap_or_default(),
        last_seen_at: parse_ts(&last_seen_at),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        deleted_at: parse_ts_opt(deleted_at),
        embedding: embedding.as_deref().and_then(embedding_from_bytes),
        embedding_updated_at: parse_ts_opt(embedding_updated_at),
        decayed_weeks: row.get(18)?,
    })
}

/// Insert a new memory row. FTS sync is the caller's responsibility so it
/// lands in the same transaction.
pub fn insert_memory(conn: &Connection, memory: &Memory) -> Result<()> {
    conn.execute(
        "INSERT INTO memories (id, user_id, thread_id, content, entities, priority, confidence,
            redaction_map, tier, source_thread_id, repeats, thread_set, last_seen_at,
            created_at, updated_at, deleted_at, embedding, embedding_updated_at, decayed_weeks)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        params![
            memory.id,
            memory.user_id,
            memory.thread_id,
            memory.content,
            memory.entities.as_ref().map(|e| serde_json::to_string(e).unwrap_or_default()),
            memory.priority,
            memory.confidence,
            memory
                .redaction_map
                .as_ref()
                .map(|m| serde_json::to_string(m).unwrap_or_default()),
            memory.tier.as_str(),
            memory.source_thread_id,
            memory.repeats,
            serde_json::to_string(&memory.thread_set)?,
            memory.last_seen_at.to_rfc3339(),
            memory.created_at.to_rfc3339(),
            memory.updated_at.to_rfc3339(),
            memory.deleted_at.map(|d| d.to_rfc3339()),
            memory.embedding.as_deref().map(embedding_to_bytes),
            memory.embedding_updated_at.map(|d| d.to_rfc3339()),
            memory.decayed_weeks,
        ],
    )?;
    Ok(())
}

/// Rewrite the mutable columns of an existing memory
pub fn update_memory(conn: &Connection, memory: &Memory) -> Result<()> {
    conn.execute(
        "UPDATE memories SET content = ?2, entities = ?3, priority = ?4, confidence = ?5,
            redaction_map = ?6, tier = ?7, thread_id = ?8, repeats = ?9, thread_set = ?10,
            last_seen_at = ?11, updated_at = ?12, deleted_at = ?13,
            embedding = ?14, embedding_updated_at = ?15, decayed_weeks = ?16
         WHERE id = ?1",
        params![
            memory.id,
            memory.content,
            memory.entities.as_ref().map(|e| serde_json::to_string(e).unwrap_or_default()),
            memory.priority,
            memory.confidence,
            memory
                .redaction_map
                .as_ref()
                .map(|m| serde_json::to_string(m).unwrap_or_default()),
            memory.tier.as_str(),
            memory.thread_id,
            memory.repeats,
            serde_json::to_string(&memory.thread_set)?,
            memory.last_seen_at.to_rfc3339(),
            memory.updated_at.to_rfc3339(),
            memory.deleted_at.map(|d| d.to_rfc3339()),
            memory.embedding.as_deref().map(embedding_to_bytes),
            memory.embedding_updated_at.map(|d| d.to_rfc3339()),
            memory.decayed_weeks,
        ],
    )?;
    Ok(())
}

/// Fetch a memory owned by the user
pub fn get_memory(conn: &Connection, user_id: &str, id: &str) -> Result<Option<Memory>> {
    let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE user_id = ?1 AND id = ?2");
    Ok(conn
        .query_row(&sql, params![user_id, id], memory_from_row)
        .optional()?)
}

/// List memories with paging and the standard filters
pub fn list_memories(conn: &Connection, user_id: &str, options: &ListOptions) -> Result<(Vec<Memory>, i64)> {
    let mut where_sql = String::from("user_id = ?");
    let mut bind: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(user_id.to_string())];

    if !options.include_deleted {
        where_sql.push_str(" AND deleted_at IS NULL");
    }
    if let Some(ref thread_id) = options.thread_id {
        where_sql.push_str(" AND thread_id = ?");
        bind.push(Box::new(thread_id.clone()));
    }
    if let Some(min_priority) = options.min_priority {
        where_sql.push_str(" AND priority >= ?");
        bind.push(Box::new(min_priority as f64));
    }

    let count_sql = format!("SELECT COUNT(*) FROM memories WHERE {where_sql}");
    let bind_refs: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();
    let total: i64 = conn.query_row(&count_sql, bind_refs.as_slice(), |r| r.get(0))?;

    let list_sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories WHERE {where_sql}
         ORDER BY updated_at DESC LIMIT ? OFFSET ?"
    );
    bind.push(Box::new(options.limit.max(1)));
    bind.push(Box::new(options.offset.max(0)));
    let bind_refs: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();

    let mut stmt = conn.prepare(&list_sql)?;
    let memories = stmt
        .query_map(bind_refs.as_slice(), memory_from_row)?
        .filter_map(|r| r.ok())
        .collect();

    Ok((memories, total))
}

/// Most recently seen live memories, the candidate window for supercede
pub fn recent_live_memories(conn: &Connection, user_id: &str, limit: i64) -> Result<Vec<Memory>> {
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories
         WHERE user_id = ?1 AND deleted_at IS NULL
         ORDER BY last_seen_at DESC LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let memories = stmt
        .query_map(params![user_id, limit], memory_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(memories)
}

/// Live memories carrying an embedding, bounded for the semantic pass
pub fn live_memories_with_embeddings(conn: &Connection, user_id: &str, limit: i64) -> Result<Vec<Memory>> {
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories
         WHERE user_id = ?1 AND deleted_at IS NULL AND embedding IS NOT NULL
         ORDER BY last_seen_at DESC LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let memories = stmt
        .query_map(params![user_id, limit], memory_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(memories)
}

/// Top live memories by priority, input for the profile builder
pub fn top_memories_by_priority(conn: &Connection, user_id: &str, limit: i64) -> Result<Vec<Memory>> {
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories
         WHERE user_id = ?1 AND deleted_at IS NULL
         ORDER BY priority DESC, updated_at DESC LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let memories = stmt
        .query_map(params![user_id, limit], memory_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(memories)
}

/// Every live memory across users (retention sweep)
pub fn all_live_memories(conn: &Connection) -> Result<Vec<Memory>> {
    let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE deleted_at IS NULL");
    let mut stmt = conn.prepare(&sql)?;
    let memories = stmt
        .query_map([], memory_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(memories)
}

/// Soft-delete a memory; returns false when the row is missing or already
/// deleted. The caller removes the FTS row in the same transaction.
pub fn soft_delete_memory(conn: &Connection, user_id: &str, id: &str, now: DateTime<Utc>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE memories SET deleted_at = ?3, updated_at = ?3
         WHERE user_id = ?1 AND id = ?2 AND deleted_at IS NULL",
        params![user_id, id, now.to_rfc3339()],
    )?;
    Ok(changed > 0)
}

/// Store an embedding on a memory
pub fn set_embedding(conn: &Connection, memory_id: &str, embedding: &[f32], now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE memories SET embedding = ?2, embedding_updated_at = ?3 WHERE id = ?1",
        params![memory_id, embedding_to_bytes(embedding), now.to_rfc3339()],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// FTS synchronization and search
// ---------------------------------------------------------------------------

/// Is this memory id present in the FTS table?
pub fn fts_has(conn: &Connection, memory_id: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories_fts WHERE memory_id = ?1",
        params![memory_id],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

/// Synchronize the FTS row for a live memory (insert or update)
pub fn fts_sync(conn: &Connection, memory: &Memory) -> Result<()> {
    if fts_has(conn, &memory.id)? {
        conn.execute(
            "UPDATE memories_fts SET content = ?2, thread_id = ?3 WHERE memory_id = ?1",
            params![memory.id, memory.content, memory.thread_id],
        )?;
    } else {
        conn.execute(
            "INSERT INTO memories_fts (memory_id, user_id, thread_id, content) VALUES (?1, ?2, ?3, ?4)",
            params![memory.id, memory.user_id, memory.thread_id, memory.content],
        )?;
    }
    Ok(())
}

/// Remove the FTS row for a memory
pub fn fts_remove(conn: &Connection, memory_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM memories_fts WHERE memory_id = ?1",
        params![memory_id],
    )?;
    Ok(())
}

/// Run an FTS5 MATCH query; returns (memory_id, bm25 rank) with the most
/// relevant rows first. bm25 ranks are negative, lower is better.
pub fn fts_search(conn: &Connection, user_id: &str, fts_query: &str, limit: i64) -> Result<Vec<(MemoryId, f64)>> {
    let mut stmt = conn.prepare(
        "SELECT memory_id, bm25(memories_fts) AS rank
         FROM memories_fts
         WHERE memories_fts MATCH ?1 AND user_id = ?2
         ORDER BY rank LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(params![fts_query, user_id, limit], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Audits
// ---------------------------------------------------------------------------

pub fn insert_audit(conn: &Connection, audit: &MemoryAudit) -> Result<()> {
    conn.execute(
        "INSERT INTO memory_audits (id, user_id, thread_id, start_msg_id, end_msg_id,
            token_count, score, saved, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            audit.id,
            audit.user_id,
            audit.thread_id,
            audit.start_msg_id,
            audit.end_msg_id,
            audit.token_count,
            audit.score,
            audit.saved,
            audit.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn count_audits(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM memory_audits", [], |r| r.get(0))?)
}

/// Timestamp of the most recent audit across all users
pub fn last_audit_at(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
    let ts: Option<String> = conn
        .query_row("SELECT MAX(created_at) FROM memory_audits", [], |r| r.get(0))
        .optional()?
        .flatten();
    Ok(ts.as_deref().map(parse_ts))
}

/// A thread with its latest audit time
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditedThread {
    pub thread_id: String,
    pub last_audit_at: DateTime<Utc>,
    pub audits: i64,
}

/// Last audited threads for a user, most recent first
pub fn recent_audited_threads(
    conn: &Connection,
    user_id: &str,
    exclude_thread_id: Option<&str>,
    limit: i64,
) -> Result<Vec<AuditedThread>> {
    let mut stmt = conn.prepare(
        "SELECT thread_id, MAX(created_at) AS last_at, COUNT(*) AS n
         FROM memory_audits
         WHERE user_id = ?1 AND (?2 IS NULL OR thread_id != ?2)
         GROUP BY thread_id
         ORDER BY last_at DESC LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(params![user_id, exclude_thread_id, limit], |row| {
            Ok(AuditedThread {
                thread_id: row.get(0)?,
                last_audit_at: parse_ts(&row.get::<_, String>(1)?),
                audits: row.get(2)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Thread summaries and user profiles
// ---------------------------------------------------------------------------

pub fn upsert_thread_summary(conn: &Connection, summary: &ThreadSummary) -> Result<()> {
    conn.execute(
        "INSERT INTO thread_summaries (thread_id, user_id, summary, updated_at, deleted)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(thread_id) DO UPDATE SET
            summary = excluded.summary,
            updated_at = excluded.updated_at,
            deleted = excluded.deleted",
        params![
            summary.thread_id,
            summary.user_id,
            summary.summary,
            summary.updated_at.to_rfc3339(),
            summary.deleted as i64,
        ],
    )?;
    Ok(())
}

pub fn get_thread_summary(conn: &Connection, user_id: &str, thread_id: &str) -> Result<Option<ThreadSummary>> {
    Ok(conn
        .query_row(
            "SELECT thread_id, user_id, summary, updated_at, deleted
             FROM thread_summaries WHERE user_id = ?1 AND thread_id = ?2 AND deleted = 0",
            params![user_id, thread_id],
            |row| {
                Ok(ThreadSummary {
                    thread_id: row.get(0)?,
                    user_id: row.get(1)?,
                    summary: row.get(2)?,
                    updated_at: parse_ts(&row.get::<_, String>(3)?),
                    deleted: row.get::<_, i64>(4)? != 0,
                })
            },
        )
        .optional()?)
}

pub fn upsert_profile(conn: &Connection, user_id: &str, profile_json: &str, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO user_profiles (user_id, profile, last_updated)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(user_id) DO UPDATE SET
            profile = excluded.profile,
            last_updated = excluded.last_updated",
        params![user_id, profile_json, now.to_rfc3339()],
    )?;
    Ok(())
}

pub fn get_profile(conn: &Connection, user_id: &str) -> Result<Option<(String, DateTime<Utc>)>> {
    Ok(conn
        .query_row(
            "SELECT profile, last_updated FROM user_profiles WHERE user_id = ?1",
            params![user_id],
            |row| Ok((row.get::<_, String>(0)?, parse_ts(&row.get::<_, String>(1)?))),
        )
        .optional()?)
}

// ---------------------------------------------------------------------------
// Embedding backlog
// ---------------------------------------------------------------------------

/// Queue a memory for background embedding. A memory with a pending item is
/// not queued twice; the newer content wins.
pub fn enqueue_embedding(conn: &Connection, memory_id: &str, content: &str, now: DateTime<Utc>) -> Result<String> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM embedding_queue WHERE memory_id = ?1 AND processed_at IS NULL",
            params![memory_id],
            |r| r.get(0),
        )
        .optional()?;

    if let Some(id) = existing {
        conn.execute(
            "UPDATE embedding_queue SET content = ?2, retry_count = 0, error = NULL WHERE id = ?1",
            params![id, content],
        )?;
        return Ok(id);
    }

    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO embedding_queue (id, memory_id, content, retry_count, created_at)
         VALUES (?1, ?2, ?3, 0, ?4)",
        params![id, memory_id, content, now.to_rfc3339()],
    )?;
    Ok(id)
}

/// Oldest unprocessed backlog items
pub fn pending_embeddings(conn: &Connection, limit: i64) -> Result<Vec<EmbeddingQueueItem>> {
    let mut stmt = conn.prepare(
        "SELECT id, memory_id, content, retry_count, created_at, processed_at, error
         FROM embedding_queue WHERE processed_at IS NULL
         ORDER BY created_at ASC LIMIT ?1",
    )?;
    let items = stmt
        .query_map(params![limit], |row| {
            Ok(EmbeddingQueueItem {
                id: row.get(0)?,
                memory_id: row.get(1)?,
                content: row.get(2)?,
                retry_count: row.get(3)?,
                created_at: parse_ts(&row.get::<_, String>(4)?),
                processed_at: parse_ts_opt(row.get(5)?),
                error: row.get(6)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(items)
}

pub fn mark_embedding_processed(
    conn: &Connection,
    item_id: &str,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE embedding_queue SET processed_at = ?2, error = ?3 WHERE id = ?1",
        params![item_id, now.to_rfc3339(), error],
    )?;
    Ok(())
}

pub fn bump_embedding_retry(conn: &Connection, item_id: &str, error: &str) -> Result<i64> {
    conn.execute(
        "UPDATE embedding_queue SET retry_count = retry_count + 1, error = ?2 WHERE id = ?1",
        params![item_id, error],
    )?;
    let count: i64 = conn.query_row(
        "SELECT retry_count FROM embedding_queue WHERE id = ?1",
        params![item_id],
        |r| r.get(0),
    )?;
    Ok(count)
}

pub fn count_pending_embeddings(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM embedding_queue WHERE processed_at IS NULL",
        [],
        |r| r.get(0),
    )?)
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Store-wide memory counts for the metrics endpoint
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryCounts {
    pub total: i64,
    pub live: i64,
    pub deleted: i64,
    pub by_tier: HashMap<String, i64>,
}

pub fn memory_counts(conn: &Connection) -> Result<MemoryCounts> {
    let total: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?;
    let live: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE deleted_at IS NULL",
        [],
        |r| r.get(0),
    )?;

    let mut by_tier = HashMap::new();
    for tier in [Tier::T1, Tier::T2, Tier::T3] {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE deleted_at IS NULL AND tier = ?1",
            params![tier.as_str()],
            |r| r.get(0),
        )?;
        by_tier.insert(tier.as_str().to_string(), count);
    }

    Ok(MemoryCounts {
        total,
        live,
        deleted: total - live,
        by_tier,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn sample_memory(user_id: &str, content: &str) -> Memory {
        let now = Utc::now();
        Memory {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            thread_id: "thread-1".to_string(),
            content: content.to_string(),
            entities: None,
            priority: 0.5,
            confidence: 0.8,
            redaction_map: None,
            tier: Tier::T3,
            source_thread_id: "thread-1".to_string(),
            repeats: 1,
            thread_set: vec!["thread-1".to_string()],
            last_seen_at: now,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            embedding: None,
            embedding_updated_at: None,
            decayed_weeks: 0,
        }
    }

    #[test]
    fn insert_and_get_round_trip() {
        let storage = Storage::open_in_memory().unwrap();
        let memory = sample_memory("u1", "my favorite color is blue");

        storage
            .with_transaction(|conn| {
                insert_memory(conn, &memory)?;
                fts_sync(conn, &memory)
            })
            .unwrap();

        let loaded = storage
            .with_read(|conn| get_memory(conn, "u1", &memory.id))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.content, memory.content);
        assert_eq!(loaded.tier, Tier::T3);
        assert_eq!(loaded.thread_set, vec!["thread-1".to_string()]);

        // Wrong user sees nothing
        let other = storage.with_read(|conn| get_memory(conn, "u2", &memory.id)).unwrap();
        assert!(other.is_none());
    }

    #[test]
    fn fts_sync_and_search() {
        let storage = Storage::open_in_memory().unwrap();
        let memory = sample_memory("u1", "the deploy pipeline uses terraform");

        storage
            .with_transaction(|conn| {
                insert_memory(conn, &memory)?;
                fts_sync(conn, &memory)
            })
            .unwrap();

        let hits = storage
            .with_read(|conn| fts_search(conn, "u1", "terraform", 10))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, memory.id);

        // Sync is an update, not a duplicate insert
        let mut updated = memory.clone();
        updated.content = "the deploy pipeline uses pulumi".to_string();
        storage
            .with_transaction(|conn| {
                update_memory(conn, &updated)?;
                fts_sync(conn, &updated)
            })
            .unwrap();

        let hits = storage
            .with_read(|conn| fts_search(conn, "u1", "pulumi", 10))
            .unwrap();
        assert_eq!(hits.len(), 1);
        let stale = storage
            .with_read(|conn| fts_search(conn, "u1", "terraform", 10))
            .unwrap();
        assert!(stale.is_empty());
    }

    #[test]
    fn soft_delete_removes_from_fts() {
        let storage = Storage::open_in_memory().unwrap();
        let memory = sample_memory("u1", "remember the staging password pattern");

        storage
            .with_transaction(|conn| {
                insert_memory(conn, &memory)?;
                fts_sync(conn, &memory)
            })
            .unwrap();

        storage
            .with_transaction(|conn| {
                assert!(soft_delete_memory(conn, "u1", &memory.id, Utc::now())?);
                fts_remove(conn, &memory.id)
            })
            .unwrap();

        let has = storage.with_read(|conn| fts_has(conn, &memory.id)).unwrap();
        assert!(!has);

        let (memories, total) = storage
            .with_read(|conn| list_memories(conn, "u1", &ListOptions { limit: 10, ..Default::default() }))
            .unwrap();
        assert!(memories.is_empty());
        assert_eq!(total, 0);

        let (memories, _) = storage
            .with_read(|conn| {
                list_memories(
                    conn,
                    "u1",
                    &ListOptions {
                        include_deleted: true,
                        limit: 10,
                        ..Default::default()
                    },
                )
            })
            .unwrap();
        assert_eq!(memories.len(), 1);
    }

    #[test]
    fn embedding_round_trip() {
        let vec = vec![0.25f32, -1.5, 3.75];
        let bytes = embedding_to_bytes(&vec);
        assert_eq!(embedding_from_bytes(&bytes).unwrap(), vec);
        assert!(embedding_from_bytes(&bytes[..5]).is_none());
    }

    #[test]
    fn embedding_queue_dedupes_pending() {
        let storage = Storage::open_in_memory().unwrap();
        let now = Utc::now();

        let first = storage
            .with_write(|conn| enqueue_embedding(conn, "m1", "one", now))
            .unwrap();
        let second = storage
            .with_write(|conn| enqueue_embedding(conn, "m1", "two", now))
            .unwrap();
        assert_eq!(first, second);

        let pending = storage.with_read(|conn| pending_embeddings(conn, 10)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].content, "two");
    }
}
