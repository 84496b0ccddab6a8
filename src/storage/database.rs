use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::Result;

const SCHEMA_VERSION: i32 = 1;

/// Statements applied in order on open; each is idempotent.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS app_settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at INTEGER NOT NULL DEFAULT (unixepoch())
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS query_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        request_id TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        provider TEXT NOT NULL,
        model TEXT NOT NULL,
        use_case TEXT,
        prompt_prefix TEXT NOT NULL,
        success INTEGER NOT NULL,
        latency_ms INTEGER NOT NULL,
        total_tokens INTEGER NOT NULL,
        error TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_query_log_timestamp ON query_log(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_query_log_provider ON query_log(provider, model)",
];

/// SQLite connection pool holding the query log.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn open(path: &Path) -> Result<Self> {
        info!("Initializing database at: {:?}", path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        info!("Database initialized successfully");
        Ok(db)
    }

    /// Private in-memory database. A single connection keeps every query on
    /// the same memory store.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_database_version().await?;
        debug!("Current database version: {}", current_version);
        if current_version >= SCHEMA_VERSION {
            return Ok(());
        }

        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        sqlx::query(
            "INSERT OR REPLACE INTO app_settings (key, value, updated_at) VALUES ('database_version', ?, unixepoch())",
        )
        .bind(SCHEMA_VERSION.to_string())
        .execute(&self.pool)
        .await?;

        info!("Database schema migrated to version {}", SCHEMA_VERSION);
        Ok(())
    }

    async fn get_database_version(&self) -> Result<i32> {
        let table_exists = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type='table' AND name='app_settings'",
        )
        .fetch_optional(&self.pool)
        .await?
        .is_some();

        if !table_exists {
            return Ok(0);
        }

        let version: Option<String> =
            sqlx::query_scalar("SELECT value FROM app_settings WHERE key = 'database_version'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(version.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
        info!("Database connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_schema_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("orchestrator.db");

        let db = Database::open(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(db.get_database_version().await.unwrap(), SCHEMA_VERSION);
        db.close().await;

        let reopened = Database::open(&path).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM query_log")
            .fetch_one(reopened.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_in_memory() {
        let db = Database::in_memory().await.unwrap();
        assert_eq!(db.get_database_version().await.unwrap(), SCHEMA_VERSION);
    }
}
