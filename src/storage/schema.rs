use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::StoreError;

// ============================================================================
// Database
// ============================================================================

/// Handle to the local state store. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the store and run migrations.
    ///
    /// File-backed stores run in WAL mode: every committed write is appended
    /// to the log and replaces the previous row version atomically, so readers
    /// see either the old or the new version of an item.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let in_memory = path == ":memory:";
        let url = format!("sqlite:{}?mode=rwc", path);

        // Keep the state file private to the user
        #[cfg(unix)]
        if !in_memory {
            use std::os::unix::fs::PermissionsExt;
            let db_path = std::path::Path::new(path);
            if let Some(parent) = db_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            if db_path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "Failed to set state file permissions");
                }
            } else {
                use std::os::unix::fs::OpenOptionsExt;
                let _file = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(db_path)
                    .ok(); // If creation fails, SQLite will report the error at connect_with.
            }
        }

        // busy_timeout=5000: the CLI and the running service may share the file
        let mut options = SqliteConnectOptions::from_str(&url)?.pragma("busy_timeout", "5000");
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Writers are serialized by SQLite; the pool covers the fetch workers plus the CLI
        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10));
        if in_memory {
            // Every in-memory connection is its own database: keep exactly one alive
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        let db = Self { pool };
        db.migrate()
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(db)
    }

    /// Run schema migrations in a single transaction.
    ///
    /// Every statement is idempotent, so re-running on an existing store is a
    /// no-op; a failure rolls the whole migration back.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bookmarks (
                id TEXT PRIMARY KEY NOT NULL,
                url TEXT NOT NULL,
                title TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                content_type TEXT NOT NULL,
                local_path TEXT,
                status TEXT NOT NULL,
                last_synced_at INTEGER,
                failure_count INTEGER NOT NULL DEFAULT 0,
                article_path TEXT,
                video_path TEXT
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_bookmarks_status ON bookmarks(status)")
            .execute(&mut *tx)
            .await?;

        // Append-only cycle log; rows are inserted finalized and never updated
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_cycles (
                id INTEGER PRIMARY KEY,
                started_at INTEGER NOT NULL,
                finished_at INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                items_added INTEGER NOT NULL,
                items_archived INTEGER NOT NULL,
                items_failed INTEGER NOT NULL,
                cancelled INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sync_cycles_finished ON sync_cycles(finished_at DESC)",
        )
        .execute(&mut *tx)
        .await?;

        // Reject mutation of finalized cycle records at the storage layer
        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS sync_cycles_immutable BEFORE UPDATE ON sync_cycles
            BEGIN
                SELECT RAISE(ABORT, 'sync cycle records are append-only');
            END
        "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Close the pool, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
