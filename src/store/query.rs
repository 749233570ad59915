//! Query API for stored entries and metrics
//!
//! All filters are conjunctive. Time ranges are inclusive at both ends and
//! results always come back in ascending timestamp order.

use super::database::MonitorDb;
use super::{from_millis, LogEntry};
use crate::aggregator::{Granularity, PerformanceMetric, PerformanceSummary};
use crate::error::Result;
use crate::events::EventType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::BTreeMap;

/// Inclusive `[start, end]` time interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The last `duration` up to now
    pub fn last(duration: chrono::Duration) -> Self {
        let end = Utc::now();
        Self { start: end - duration, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }

    pub fn start_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_ms(&self) -> i64 {
        self.end.timestamp_millis()
    }
}

/// Filter for log queries
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    /// Exact function name
    pub function_name: Option<String>,

    pub event_type: Option<EventType>,

    pub session_id: Option<String>,

    /// Inclusive time window
    pub time_range: Option<TimeRange>,

    /// Maximum number of results
    pub limit: Option<usize>,

    /// Rows to skip before the first result (pagination)
    pub offset: Option<usize>,
}

/// Filter for raw metric queries
#[derive(Debug, Clone, Default)]
pub struct MetricFilter {
    pub function_name: Option<String>,
    pub session_id: Option<String>,
    pub time_range: Option<TimeRange>,
    pub limit: Option<usize>,
}

impl MonitorDb {
    /// Query log entries with flexible filtering
    ///
    /// # Example
    ///
    /// ```ignore
    /// let filter = LogFilter {
    ///     event_type: Some(EventType::FunctionFailed),
    ///     time_range: Some(TimeRange::last(chrono::Duration::hours(1))),
    ///     limit: Some(100),
    ///     ..Default::default()
    /// };
    /// let failures = db.query_logs(&filter).await?;
    /// ```
    pub async fn query_logs(&self, filter: &LogFilter) -> Result<Vec<LogEntry>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, timestamp, session_id, invocation_id, function_name, event_type, duration_ms,
                    parameters, result_summary, error_kind, error_message, error_stack,
                    memory_peak_bytes, cpu_percent, metadata
             FROM log_entries WHERE 1=1",
        );

        if let Some(function_name) = &filter.function_name {
            qb.push(" AND function_name = ").push_bind(function_name.clone());
        }
        if let Some(event_type) = filter.event_type {
            qb.push(" AND event_type = ").push_bind(event_type.as_str());
        }
        if let Some(session_id) = &filter.session_id {
            qb.push(" AND session_id = ").push_bind(session_id.clone());
        }
        if let Some(range) = filter.time_range {
            qb.push(" AND timestamp >= ").push_bind(range.start_ms());
            qb.push(" AND timestamp <= ").push_bind(range.end_ms());
        }

        qb.push(" ORDER BY timestamp ASC, id ASC");

        // SQLite only accepts OFFSET after a LIMIT; -1 means unbounded
        if filter.limit.is_some() || filter.offset.is_some() {
            let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
            qb.push(" LIMIT ").push_bind(limit);
            qb.push(" OFFSET ").push_bind(filter.offset.unwrap_or(0) as i64);
        }

        let rows = qb.build().fetch_all(self.pool()).await?;
        rows.iter().map(row_to_entry).collect()
    }

    /// Count entries matching a filter (limit/offset ignored)
    pub async fn count_logs(&self, filter: &LogFilter) -> Result<u64> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT COUNT(*) FROM log_entries WHERE 1=1");

        if let Some(function_name) = &filter.function_name {
            qb.push(" AND function_name = ").push_bind(function_name.clone());
        }
        if let Some(event_type) = filter.event_type {
            qb.push(" AND event_type = ").push_bind(event_type.as_str());
        }
        if let Some(session_id) = &filter.session_id {
            qb.push(" AND session_id = ").push_bind(session_id.clone());
        }
        if let Some(range) = filter.time_range {
            qb.push(" AND timestamp >= ").push_bind(range.start_ms());
            qb.push(" AND timestamp <= ").push_bind(range.end_ms());
        }

        let count = qb.build_query_scalar::<i64>().fetch_one(self.pool()).await?;
        Ok(count as u64)
    }

    /// Query raw performance metrics, oldest first
    pub async fn query_metrics(&self, filter: &MetricFilter) -> Result<Vec<PerformanceMetric>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT timestamp, session_id, function_name, execution_time_ms, memory_peak_bytes,
                    cpu_percent, api_calls, db_ops, success
             FROM performance_metrics WHERE 1=1",
        );

        if let Some(function_name) = &filter.function_name {
            qb.push(" AND function_name = ").push_bind(function_name.clone());
        }
        if let Some(session_id) = &filter.session_id {
            qb.push(" AND session_id = ").push_bind(session_id.clone());
        }
        if let Some(range) = filter.time_range {
            qb.push(" AND timestamp >= ").push_bind(range.start_ms());
            qb.push(" AND timestamp <= ").push_bind(range.end_ms());
        }

        qb.push(" ORDER BY timestamp ASC, id ASC");

        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(self.pool()).await?;
        Ok(rows.iter().map(row_to_metric).collect())
    }

    /// Function names that have raw metrics in `[start_ms, end_ms)`
    pub async fn metric_functions_between(&self, start_ms: i64, end_ms: i64) -> Result<Vec<String>> {
        let names = sqlx::query_scalar(
            "SELECT DISTINCT function_name FROM performance_metrics
             WHERE timestamp >= ? AND timestamp < ?
             ORDER BY function_name",
        )
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(self.pool())
        .await?;

        Ok(names)
    }

    /// Timestamp of the oldest raw metric, if any
    pub async fn oldest_metric_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        let ts: Option<i64> = sqlx::query_scalar("SELECT MIN(timestamp) FROM performance_metrics")
            .fetch_one(self.pool())
            .await?;
        Ok(ts.map(from_millis))
    }

    /// Stored summaries whose buckets start inside `range`, optionally for one function
    pub async fn query_summaries(
        &self,
        function_name: Option<&str>,
        granularity: Granularity,
        range: &TimeRange,
    ) -> Result<Vec<PerformanceSummary>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT function_name, granularity, bucket_start, bucket_end, count, success_count,
                    success_rate, mean_ms, min_ms, max_ms, p50_ms, p90_ms, p99_ms, std_dev_ms,
                    mean_memory_bytes, max_memory_bytes, mean_cpu_percent, total_api_calls, total_db_ops
             FROM performance_summaries WHERE granularity = ",
        );
        qb.push_bind(granularity.as_str());
        qb.push(" AND bucket_start >= ").push_bind(range.start_ms());
        qb.push(" AND bucket_start <= ").push_bind(range.end_ms());
        if let Some(function_name) = function_name {
            qb.push(" AND function_name = ").push_bind(function_name.to_string());
        }
        qb.push(" ORDER BY bucket_start ASC, function_name ASC");

        let rows = qb.build().fetch_all(self.pool()).await?;
        Ok(rows.iter().filter_map(row_to_summary).collect())
    }

    /// Stored summary for exactly one bucket
    pub async fn get_summary(
        &self,
        function_name: &str,
        granularity: Granularity,
        bucket_start: DateTime<Utc>,
    ) -> Result<Option<PerformanceSummary>> {
        let row = sqlx::query(
            "SELECT function_name, granularity, bucket_start, bucket_end, count, success_count,
                    success_rate, mean_ms, min_ms, max_ms, p50_ms, p90_ms, p99_ms, std_dev_ms,
                    mean_memory_bytes, max_memory_bytes, mean_cpu_percent, total_api_calls, total_db_ops
             FROM performance_summaries
             WHERE function_name = ? AND granularity = ? AND bucket_start = ?",
        )
        .bind(function_name)
        .bind(granularity.as_str())
        .bind(bucket_start.timestamp_millis())
        .fetch_optional(self.pool())
        .await?;

        Ok(row.as_ref().and_then(row_to_summary))
    }

    /// End of the newest materialised bucket for a granularity
    pub async fn latest_summary_end(&self, granularity: Granularity) -> Result<Option<DateTime<Utc>>> {
        let ts: Option<i64> =
            sqlx::query_scalar("SELECT MAX(bucket_end) FROM performance_summaries WHERE granularity = ?")
                .bind(granularity.as_str())
                .fetch_one(self.pool())
                .await?;
        Ok(ts.map(from_millis))
    }
}

fn row_to_entry(row: &SqliteRow) -> Result<LogEntry> {
    let event_type: String = row.get("event_type");
    let parameters: Option<String> = row.get("parameters");
    let metadata: String = row.get("metadata");
    let memory_peak_bytes: Option<i64> = row.get("memory_peak_bytes");

    let metadata: BTreeMap<String, serde_json::Value> = if metadata.is_empty() {
        BTreeMap::new()
    } else {
        serde_json::from_str(&metadata)?
    };

    Ok(LogEntry {
        id: Some(row.get("id")),
        timestamp: from_millis(row.get("timestamp")),
        session_id: row.get("session_id"),
        invocation_id: row.get("invocation_id"),
        function_name: row.get("function_name"),
        event_type: event_type
            .parse()
            .map_err(crate::error::MonitorError::Persistence)?,
        duration_ms: row.get("duration_ms"),
        parameters: parameters.map(|p| serde_json::from_str(&p)).transpose()?,
        result_summary: row.get("result_summary"),
        error_kind: row.get("error_kind"),
        error_message: row.get("error_message"),
        error_stack: row.get("error_stack"),
        memory_peak_bytes: memory_peak_bytes.map(|m| m as u64),
        cpu_percent: row.get("cpu_percent"),
        metadata,
    })
}

fn row_to_metric(row: &SqliteRow) -> PerformanceMetric {
    PerformanceMetric {
        timestamp: from_millis(row.get("timestamp")),
        session_id: row.get("session_id"),
        function_name: row.get("function_name"),
        execution_time_ms: row.get("execution_time_ms"),
        memory_peak_bytes: row.get::<i64, _>("memory_peak_bytes") as u64,
        cpu_percent: row.get("cpu_percent"),
        api_calls: row.get::<i64, _>("api_calls") as u64,
        db_ops: row.get::<i64, _>("db_ops") as u64,
        success: row.get("success"),
    }
}

fn row_to_summary(row: &SqliteRow) -> Option<PerformanceSummary> {
    let granularity: String = row.get("granularity");

    Some(PerformanceSummary {
        function_name: row.get("function_name"),
        granularity: granularity.parse().ok()?,
        bucket_start: from_millis(row.get("bucket_start")),
        bucket_end: from_millis(row.get("bucket_end")),
        count: row.get::<i64, _>("count") as u64,
        success_count: row.get::<i64, _>("success_count") as u64,
        success_rate: row.get("success_rate"),
        mean_ms: row.get("mean_ms"),
        min_ms: row.get("min_ms"),
        max_ms: row.get("max_ms"),
        p50_ms: row.get("p50_ms"),
        p90_ms: row.get("p90_ms"),
        p99_ms: row.get("p99_ms"),
        std_dev_ms: row.get("std_dev_ms"),
        mean_memory_bytes: row.get("mean_memory_bytes"),
        max_memory_bytes: row.get::<i64, _>("max_memory_bytes") as u64,
        mean_cpu_percent: row.get("mean_cpu_percent"),
        total_api_calls: row.get::<i64, _>("total_api_calls") as u64,
        total_db_ops: row.get::<i64, _>("total_db_ops") as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(ts_ms: i64, function: &str, event_type: EventType, session: &str) -> LogEntry {
        LogEntry {
            id: None,
            timestamp: Utc.timestamp_millis_opt(ts_ms).unwrap(),
            session_id: session.to_string(),
            invocation_id: format!("inv-{}", ts_ms),
            function_name: function.to_string(),
            event_type,
            duration_ms: if event_type.is_terminal() { Some(12.5) } else { None },
            parameters: None,
            result_summary: None,
            error_kind: None,
            error_message: None,
            error_stack: None,
            memory_peak_bytes: Some(2048),
            cpu_percent: None,
            metadata: BTreeMap::new(),
        }
    }

    async fn seeded_db() -> MonitorDb {
        let db = MonitorDb::in_memory().await.unwrap();
        db.insert_log_entries(&[
            entry(3_000, "fetch", EventType::FunctionFailed, "s1"),
            entry(1_000, "fetch", EventType::FunctionStarted, "s1"),
            entry(2_000, "score", EventType::FunctionStarted, "s2"),
            entry(4_000, "fetch", EventType::FunctionCompleted, "s2"),
            entry(5_000, "score", EventType::FunctionCompleted, "s2"),
        ])
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn test_results_are_ascending_by_time() {
        let db = seeded_db().await;
        let logs = db.query_logs(&LogFilter::default()).await.unwrap();

        let times: Vec<i64> = logs.iter().map(|l| l.timestamp.timestamp_millis()).collect();
        assert_eq!(times, vec![1_000, 2_000, 3_000, 4_000, 5_000]);
    }

    #[tokio::test]
    async fn test_filters_are_conjunctive() {
        let db = seeded_db().await;
        let filter = LogFilter {
            function_name: Some("fetch".to_string()),
            session_id: Some("s2".to_string()),
            ..Default::default()
        };

        let logs = db.query_logs(&filter).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].event_type, EventType::FunctionCompleted);
    }

    #[tokio::test]
    async fn test_time_range_is_inclusive() {
        let db = seeded_db().await;
        let range = TimeRange::new(
            Utc.timestamp_millis_opt(2_000).unwrap(),
            Utc.timestamp_millis_opt(4_000).unwrap(),
        );
        let filter = LogFilter { time_range: Some(range), ..Default::default() };

        let logs = db.query_logs(&filter).await.unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(db.count_logs(&filter).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_limit_and_offset_paginate() {
        let db = seeded_db().await;
        let page = LogFilter { limit: Some(2), offset: Some(2), ..Default::default() };

        let logs = db.query_logs(&page).await.unwrap();
        let times: Vec<i64> = logs.iter().map(|l| l.timestamp.timestamp_millis()).collect();
        assert_eq!(times, vec![3_000, 4_000]);

        let tail = LogFilter { offset: Some(4), ..Default::default() };
        assert_eq!(db.query_logs(&tail).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stored_entry_reads_back_equal() {
        let db = MonitorDb::in_memory().await.unwrap();
        let mut original = entry(7_000, "fetch", EventType::FunctionFailed, "s9");
        original.error_kind = Some("timeout".to_string());
        original.parameters = Some(serde_json::json!({"limit": 10}));
        original.metadata.insert("step".to_string(), "fetch".into());

        let ids = db.insert_log_entries(std::slice::from_ref(&original)).await.unwrap();
        let read = db.query_logs(&LogFilter::default()).await.unwrap();

        original.id = Some(ids[0]);
        assert_eq!(read, vec![original]);
    }
}
