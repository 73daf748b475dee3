//! Database migrations for Mnemo

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < SCHEMA_VERSION {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Initial schema (v1): memories, audits, summaries, profiles, embedding queue
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Memories: the id is an opaque text key, not a rowid
        CREATE TABLE IF NOT EXISTS memories (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            thread_id TEXT NOT NULL,
            content TEXT NOT NULL,
            entities TEXT,
            priority REAL NOT NULL DEFAULT 0.5,
            confidence REAL NOT NULL DEFAULT 0.5,
            redaction_map TEXT,
            tier TEXT NOT NULL DEFAULT 't3',
            source_thread_id TEXT NOT NULL,
            repeats INTEGER NOT NULL DEFAULT 1,
            thread_set TEXT NOT NULL DEFAULT '[]',
            last_seen_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            embedding BLOB,
            embedding_updated_at TEXT,
            decayed_weeks INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_memories_user_thread
            ON memories(user_id, thread_id) WHERE deleted_at IS NULL;
        CREATE INDEX IF NOT EXISTS idx_memories_user_tier
            ON memories(user_id, tier, updated_at DESC);
        CREATE INDEX IF NOT EXISTS idx_memories_user_created
            ON memories(user_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_memories_user_seen
            ON memories(user_id, last_seen_at DESC);
        CREATE INDEX IF NOT EXISTS idx_memories_priority
            ON memories(priority DESC) WHERE deleted_at IS NULL;

        -- Audit runs (append-only)
        CREATE TABLE IF NOT EXISTS memory_audits (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            thread_id TEXT NOT NULL,
            start_msg_id TEXT,
            end_msg_id TEXT,
            token_count INTEGER NOT NULL DEFAULT 0,
            score REAL NOT NULL DEFAULT 0,
            saved INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audits_user_created
            ON memory_audits(user_id, created_at DESC);

        -- Per-thread LLM summaries
        CREATE TABLE IF NOT EXISTS thread_summaries (
            thread_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            summary TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0
        );

        -- Derived per-user profiles (upsert-only)
        CREATE TABLE IF NOT EXISTS user_profiles (
            user_id TEXT PRIMARY KEY,
            profile TEXT NOT NULL,
            last_updated TEXT NOT NULL
        );

        -- Persistent embedding backlog
        CREATE TABLE IF NOT EXISTS embedding_queue (
            id TEXT PRIMARY KEY,
            memory_id TEXT NOT NULL,
            content TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            processed_at TEXT,
            error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_embedding_queue_pending
            ON embedding_queue(created_at) WHERE processed_at IS NULL;
        "#,
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
    tracing::info!("Applied migration v1");
    Ok(())
}

/// v2: full-text index over live memory content
///
/// Synchronization is explicit in the query layer: the memories primary key
/// is text, so rowid-based triggers cannot be used.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
            memory_id UNINDEXED,
            user_id UNINDEXED,
            thread_id UNINDEXED,
            content
        );
        "#,
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (2)", [])?;
    tracing::info!("Applied migration v2");
    Ok(())
}
