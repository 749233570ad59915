//! SQLite database layer for monitoring data
//!
//! This module provides async database operations with:
//! - Connection pooling
//! - Embedded migrations
//! - Transactional batch inserts (an entry and its index rows become visible together)
//! - WAL mode for concurrent reads/writes

use crate::aggregator::{PerformanceMetric, PerformanceSummary};
use crate::error::Result;
use crate::store::LogEntry;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Monitoring database handle
pub struct MonitorDb {
    pool: SqlitePool,
    file_path: Option<PathBuf>,
}

impl MonitorDb {
    /// Open (or create) the database and run migrations
    ///
    /// # Arguments
    ///
    /// * `database_url` - e.g. `sqlite:./data/monitoring.db` or `sqlite::memory:`
    pub async fn new(database_url: &str) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");

        let file_path = if in_memory {
            None
        } else {
            let path = PathBuf::from(database_url.trim_start_matches("sqlite://").trim_start_matches("sqlite:"));
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            Some(path)
        };

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .pragma("cache_size", "-16000")
            .pragma("temp_store", "memory")
            .pragma("synchronous", "NORMAL");

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30));

        if in_memory {
            // The shared in-memory database lives only as long as a connection does
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!(url = %database_url, "Monitoring database ready");

        Ok(Self { pool, file_path })
    }

    /// Private in-memory database, used by tests and dry runs
    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    /// Insert log entries in a single transaction, returning their row ids
    pub async fn insert_log_entries(&self, entries: &[LogEntry]) -> Result<Vec<i64>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(entries.len());

        for entry in entries {
            let parameters = entry.parameters.as_ref().map(serde_json::to_string).transpose()?;
            let metadata = serde_json::to_string(&entry.metadata)?;

            let result = sqlx::query(
                "INSERT INTO log_entries
                 (timestamp, session_id, invocation_id, function_name, event_type, duration_ms,
                  parameters, result_summary, error_kind, error_message, error_stack,
                  memory_peak_bytes, cpu_percent, metadata)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(entry.timestamp.timestamp_millis())
            .bind(&entry.session_id)
            .bind(&entry.invocation_id)
            .bind(&entry.function_name)
            .bind(entry.event_type.as_str())
            .bind(entry.duration_ms)
            .bind(parameters)
            .bind(&entry.result_summary)
            .bind(&entry.error_kind)
            .bind(&entry.error_message)
            .bind(&entry.error_stack)
            .bind(entry.memory_peak_bytes.map(|m| m as i64))
            .bind(entry.cpu_percent)
            .bind(metadata)
            .execute(&mut *tx)
            .await?;

            ids.push(result.last_insert_rowid());
        }

        tx.commit().await?;
        Ok(ids)
    }

    /// Insert raw performance metrics in a single transaction
    pub async fn insert_metrics(&self, metrics: &[PerformanceMetric]) -> Result<()> {
        if metrics.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for metric in metrics {
            sqlx::query(
                "INSERT INTO performance_metrics
                 (timestamp, session_id, function_name, execution_time_ms, memory_peak_bytes,
                  cpu_percent, api_calls, db_ops, success)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(metric.timestamp.timestamp_millis())
            .bind(&metric.session_id)
            .bind(&metric.function_name)
            .bind(metric.execution_time_ms)
            .bind(metric.memory_peak_bytes as i64)
            .bind(metric.cpu_percent)
            .bind(metric.api_calls as i64)
            .bind(metric.db_ops as i64)
            .bind(metric.success)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Store materialised summaries
    ///
    /// With `replace == false` existing rows win, so a summary written while
    /// its raw metrics were complete is never overwritten from a partial set.
    pub async fn store_summaries(&self, summaries: &[PerformanceSummary], replace: bool) -> Result<u64> {
        if summaries.is_empty() {
            return Ok(0);
        }

        let verb = if replace { "INSERT OR REPLACE" } else { "INSERT OR IGNORE" };
        let sql = format!(
            "{} INTO performance_summaries
             (function_name, granularity, bucket_start, bucket_end, count, success_count,
              success_rate, mean_ms, min_ms, max_ms, p50_ms, p90_ms, p99_ms, std_dev_ms,
              mean_memory_bytes, max_memory_bytes, mean_cpu_percent, total_api_calls,
              total_db_ops, computed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            verb
        );

        let computed_at = crate::events::current_millis();
        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for s in summaries {
            let result = sqlx::query(&sql)
                .bind(&s.function_name)
                .bind(s.granularity.as_str())
                .bind(s.bucket_start.timestamp_millis())
                .bind(s.bucket_end.timestamp_millis())
                .bind(s.count as i64)
                .bind(s.success_count as i64)
                .bind(s.success_rate)
                .bind(s.mean_ms)
                .bind(s.min_ms)
                .bind(s.max_ms)
                .bind(s.p50_ms)
                .bind(s.p90_ms)
                .bind(s.p99_ms)
                .bind(s.std_dev_ms)
                .bind(s.mean_memory_bytes)
                .bind(s.max_memory_bytes as i64)
                .bind(s.mean_cpu_percent)
                .bind(s.total_api_calls as i64)
                .bind(s.total_db_ops as i64)
                .bind(computed_at)
                .execute(&mut *tx)
                .await?;
            written += result.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    /// Delete rows outside their retention windows
    ///
    /// Rows strictly older than a cutoff go; a row exactly at the cutoff stays.
    /// Summaries are only removed once their whole bucket is past the summary cutoff.
    pub async fn delete_expired(&self, log_cutoff_ms: i64, summary_cutoff_ms: i64) -> Result<CleanupStats> {
        let mut tx = self.pool.begin().await?;

        let log_entries_deleted = sqlx::query("DELETE FROM log_entries WHERE timestamp < ?")
            .bind(log_cutoff_ms)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let metrics_deleted = sqlx::query("DELETE FROM performance_metrics WHERE timestamp < ?")
            .bind(log_cutoff_ms)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let summaries_deleted = sqlx::query("DELETE FROM performance_summaries WHERE bucket_end < ?")
            .bind(summary_cutoff_ms)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        Ok(CleanupStats {
            log_entries_deleted,
            metrics_deleted,
            summaries_deleted,
            summaries_materialized: 0,
            text_logs_deleted: 0,
        })
    }

    pub async fn get_stats(&self) -> Result<DatabaseStats> {
        let log_entry_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM log_entries")
            .fetch_one(&self.pool)
            .await?;
        let metric_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM performance_metrics")
            .fetch_one(&self.pool)
            .await?;
        let summary_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM performance_summaries")
            .fetch_one(&self.pool)
            .await?;

        let database_size_bytes = self
            .file_path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(DatabaseStats {
            log_entry_count: log_entry_count as u64,
            metric_count: metric_count as u64,
            summary_count: summary_count as u64,
            database_size_bytes,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub log_entry_count: u64,
    pub metric_count: u64,
    pub summary_count: u64,
    pub database_size_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupStats {
    pub log_entries_deleted: u64,
    pub metrics_deleted: u64,
    pub summaries_deleted: u64,
    pub summaries_materialized: u64,
    pub text_logs_deleted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn entry(ts_ms: i64, function: &str) -> LogEntry {
        LogEntry {
            id: None,
            timestamp: Utc.timestamp_millis_opt(ts_ms).unwrap(),
            session_id: "s1".to_string(),
            invocation_id: format!("inv-{}", ts_ms),
            function_name: function.to_string(),
            event_type: EventType::FunctionStarted,
            duration_ms: None,
            parameters: Some(serde_json::json!({"args_count": 2})),
            result_summary: None,
            error_kind: None,
            error_message: None,
            error_stack: None,
            memory_peak_bytes: None,
            cpu_percent: None,
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_database_creation() {
        let db = MonitorDb::in_memory().await.unwrap();
        let stats = db.get_stats().await.unwrap();

        assert_eq!(stats.log_entry_count, 0);
        assert_eq!(stats.metric_count, 0);
        assert_eq!(stats.summary_count, 0);
    }

    #[tokio::test]
    async fn test_batch_insert_returns_ids() {
        let db = MonitorDb::in_memory().await.unwrap();
        let entries: Vec<LogEntry> = (0..10).map(|i| entry(1_000 + i, "score")).collect();

        let ids = db.insert_log_entries(&entries).await.unwrap();
        assert_eq!(ids.len(), 10);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let stats = db.get_stats().await.unwrap();
        assert_eq!(stats.log_entry_count, 10);
    }

    #[tokio::test]
    async fn test_delete_expired_keeps_boundary_rows() {
        let db = MonitorDb::in_memory().await.unwrap();
        db.insert_log_entries(&[entry(999, "a"), entry(1_000, "b"), entry(1_001, "c")])
            .await
            .unwrap();

        let stats = db.delete_expired(1_000, 0).await.unwrap();
        assert_eq!(stats.log_entries_deleted, 1);

        let again = db.delete_expired(1_000, 0).await.unwrap();
        assert_eq!(again.log_entries_deleted, 0);
    }
}
