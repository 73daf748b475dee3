//! Database connection management
//!
//! One write connection serializes all durable mutations; reads go through
//! a small round-robin pool. In-memory databases share the write connection
//! for reads, since separate `:memory:` connections would be distinct
//! databases.

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::migrations::run_migrations;
use crate::error::Result;
use crate::types::StorageConfig;

/// Storage engine wrapping SQLite
pub struct Storage {
    config: StorageConfig,
    writer: Arc<Mutex<Connection>>,
    readers: Vec<Arc<Mutex<Connection>>>,
    next_reader: Arc<AtomicUsize>,
}

impl Storage {
    /// Open or create a database with the given configuration
    pub fn open(config: StorageConfig) -> Result<Self> {
        let writer = Self::create_connection(&config)?;
        run_migrations(&writer)?;

        let writer = Arc::new(Mutex::new(writer));

        let mut readers = Vec::new();
        if config.db_path != ":memory:" {
            for _ in 0..config.read_pool_size {
                let conn = Self::create_connection(&config)?;
                readers.push(Arc::new(Mutex::new(conn)));
            }
        }

        Ok(Self {
            config,
            writer,
            readers,
            next_reader: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Open an in-memory database (tests)
    pub fn open_in_memory() -> Result<Self> {
        Self::open(StorageConfig::in_memory())
    }

    fn create_connection(config: &StorageConfig) -> Result<Connection> {
        let conn = if config.db_path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(&config.db_path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            Connection::open_with_flags(&config.db_path, flags)?
        };

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA wal_autocheckpoint=1000;
            PRAGMA busy_timeout=30000;
            PRAGMA cache_size=-64000;
            PRAGMA temp_store=MEMORY;
            PRAGMA mmap_size=268435456;
            PRAGMA foreign_keys=ON;
            "#,
        )?;

        Ok(conn)
    }

    /// Execute a read-only function on a pooled connection
    pub fn with_read<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn_arc = if self.readers.is_empty() {
            self.writer.clone()
        } else {
            let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
            self.readers[idx].clone()
        };
        let conn = conn_arc.lock();
        f(&conn)
    }

    /// Execute a function on the write connection
    pub fn with_write<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.writer.lock();
        f(&conn)
    }

    /// Execute a function inside a write transaction
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Database size in bytes
    pub fn db_size(&self) -> Result<i64> {
        self.with_read(|conn| {
            let size: i64 = conn.query_row(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                [],
                |row| row.get(0),
            )?;
            Ok(size)
        })
    }

    /// Checkpoint the WAL file (called on shutdown)
    pub fn checkpoint(&self) -> Result<()> {
        if self.config.db_path != ":memory:" {
            let conn = self.writer.lock();
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        }
        Ok(())
    }

    pub fn db_path(&self) -> &str {
        &self.config.db_path
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            writer: self.writer.clone(),
            readers: self.readers.clone(),
            next_reader: self.next_reader.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory() {
        let storage = Storage::open_in_memory().unwrap();
        assert_eq!(storage.db_path(), ":memory:");
        assert!(storage.db_size().unwrap() > 0);
    }

    #[test]
    fn read_pool_shares_schema() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            db_path: dir.path().join("mnemo.db").to_string_lossy().into_owned(),
            read_pool_size: 2,
        };
        let storage = Storage::open(config).unwrap();

        storage
            .with_write(|conn| {
                conn.execute(
                    "INSERT INTO user_profiles (user_id, profile, last_updated) VALUES ('u', '{}', '2026-01-01T00:00:00Z')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let count: i64 = storage
            .with_read(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM user_profiles", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
