use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::Result;

/// One completion attempt as seen by the manager.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueryLogEntry {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub use_case: Option<String>,
    pub prompt_prefix: String,
    pub success: bool,
    pub latency_ms: u64,
    pub total_tokens: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct QueryLogStats {
    pub total_queries: u64,
    pub successful_queries: u64,
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub total_tokens: u64,
}

/// Append-only query log backed by SQLite.
#[derive(Clone)]
pub struct QueryLog {
    pool: SqlitePool,
    prefix_chars: usize,
}

impl QueryLog {
    pub fn new(pool: SqlitePool, prefix_chars: usize) -> Self {
        Self { pool, prefix_chars }
    }

    /// Truncates a prompt to the configured prefix length on a character
    /// boundary.
    pub fn prompt_prefix(&self, prompt: &str) -> String {
        prompt.chars().take(self.prefix_chars).collect()
    }

    pub async fn record(&self, entry: &QueryLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO query_log (
                request_id, timestamp, provider, model, use_case, prompt_prefix,
                success, latency_ms, total_tokens, error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.request_id)
        .bind(entry.timestamp.timestamp_millis())
        .bind(&entry.provider)
        .bind(&entry.model)
        .bind(&entry.use_case)
        .bind(self.prompt_prefix(&entry.prompt_prefix))
        .bind(entry.success)
        .bind(entry.latency_ms as i64)
        .bind(entry.total_tokens as i64)
        .bind(&entry.error)
        .execute(&self.pool)
        .await?;

        debug!(
            "Logged query {} to {}:{} (success={})",
            entry.request_id, entry.provider, entry.model, entry.success
        );
        Ok(())
    }

    /// Most recent entries first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<QueryLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT request_id, timestamp, provider, model, use_case, prompt_prefix,
                   success, latency_ms, total_tokens, error
            FROM query_log
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let entries = rows
            .into_iter()
            .map(|row| {
                let millis: i64 = row.get("timestamp");
                QueryLogEntry {
                    request_id: row.get("request_id"),
                    timestamp: Utc
                        .timestamp_millis_opt(millis)
                        .single()
                        .unwrap_or_else(Utc::now),
                    provider: row.get("provider"),
                    model: row.get("model"),
                    use_case: row.get("use_case"),
                    prompt_prefix: row.get("prompt_prefix"),
                    success: row.get("success"),
                    latency_ms: row.get::<i64, _>("latency_ms") as u64,
                    total_tokens: row.get::<i64, _>("total_tokens") as u32,
                    error: row.get("error"),
                }
            })
            .collect();
        Ok(entries)
    }

    pub async fn stats(&self) -> Result<QueryLogStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) as total,
                COALESCE(SUM(CASE WHEN success THEN 1 ELSE 0 END), 0) as successful,
                COALESCE(AVG(latency_ms), 0.0) as avg_latency,
                COALESCE(SUM(total_tokens), 0) as tokens
            FROM query_log
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.get("total");
        let successful: i64 = row.get("successful");
        let average_latency_ms: f64 = row.get("avg_latency");
        let tokens: i64 = row.get("tokens");

        Ok(QueryLogStats {
            total_queries: total as u64,
            successful_queries: successful as u64,
            success_rate: if total > 0 {
                successful as f64 / total as f64
            } else {
                0.0
            },
            average_latency_ms,
            total_tokens: tokens as u64,
        })
    }
}
