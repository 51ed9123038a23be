//! SQLite persistence for the memory store
//!
//! One database file per data directory. The pool runs in WAL mode: an
//! append from one pipeline never blocks a similarity query from another,
//! and readers only ever see committed records.

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::ConnectOptions;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::llm::Embedder;

pub mod memory;

pub use memory::{MemoryError, MemoryStats, MemoryStore, RetentionPolicy, SqliteMemoryStore};

const MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Schema scripts, applied in order on every open
const MIGRATIONS: &[(&str, &str)] = &[(
    "001_memory.sql",
    include_str!("../../migrations/001_memory.sql"),
)];

/// Handle to the memory database
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at `db_path` and bring its schema up
    /// to date. Missing parent directories are created.
    ///
    /// A WAL left behind by a crash is replayed by SQLite itself on open.
    pub async fn new(db_path: &Path) -> Result<Self> {
        info!(path = %db_path.display(), "Opening memory database");

        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Cannot create {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .with_context(|| format!("Cannot open {}", db_path.display()))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        for (name, script) in MIGRATIONS {
            sqlx::raw_sql(*script)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Migration {} failed", name))?;
            debug!(migration = *name, "Schema applied");
        }
        Ok(())
    }

    /// Shared connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Checkpoint the WAL into the main database file
    pub async fn flush_wal(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .context("WAL checkpoint failed")?;
        debug!("WAL checkpointed");
        Ok(())
    }

    /// Checkpoint and release every pooled connection
    pub async fn close(self) -> Result<()> {
        self.flush_wal().await?;
        self.pool.close().await;
        info!("Memory database closed");
        Ok(())
    }

    /// Memory store over this database. The embedder is only consulted for
    /// text queries; stored records carry their own vectors.
    pub fn memory(&self, embedder: Arc<dyn Embedder>) -> SqliteMemoryStore {
        SqliteMemoryStore::new(self.pool.clone(), embedder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn schema_objects(db: &Database, kind: &str) -> Vec<String> {
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = ?1")
            .bind(kind)
            .fetch_all(db.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_missing_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("b").join("memory.db");

        let db = Database::new(&path).await.unwrap();
        assert!(path.exists());

        let one: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(one, 1);

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_schema_has_records_table_and_guard_trigger() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("memory.db")).await.unwrap();

        assert!(schema_objects(&db, "table")
            .await
            .iter()
            .any(|t| t == "memory_records"));
        assert!(schema_objects(&db, "trigger")
            .await
            .iter()
            .any(|t| t == "memory_records_append_only"));

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_reapplies_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memory.db");

        for _ in 0..3 {
            Database::new(&path).await.unwrap().close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_pool_uses_wal_journal() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("memory.db")).await.unwrap();

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert!(mode.eq_ignore_ascii_case("wal"));

        db.flush_wal().await.unwrap();
        db.close().await.unwrap();
    }
}
