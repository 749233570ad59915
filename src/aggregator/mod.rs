//! Performance aggregation
//!
//! Raw `PerformanceMetric` rows are summarised per function and time bucket.
//! Sealed buckets are materialised into `performance_summaries` so they
//! survive the deletion of the raw rows; open buckets are always computed live.

mod summary;
mod trend;

pub use summary::{bucket_bounds, buckets_in, summarize, Granularity, PerformanceSummary};
pub use trend::{detect_trend, linear_slope, relative_slope, TrendDirection, TrendMetric};

use crate::bus::{EventBus, SubscriptionId};
use crate::config::ConfigManager;
use crate::error::Result;
use crate::events::{Event, EventPayload};
use crate::store::{MetricFilter, MonitorDb, TimeRange};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Durations kept per function for the rolling baseline
pub const BASELINE_WINDOW: usize = 100;

/// One instrumented call with performance tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub function_name: String,
    pub execution_time_ms: f64,
    pub memory_peak_bytes: u64,
    pub cpu_percent: f64,
    pub api_calls: u64,
    pub db_ops: u64,
    pub success: bool,
}

#[derive(Debug, Default)]
struct RollingStats {
    count: u64,
    failures: u64,
    recent_ms: VecDeque<f64>,
}

impl RollingStats {
    fn record(&mut self, metric: &PerformanceMetric) {
        self.count += 1;
        if !metric.success {
            self.failures += 1;
        }
        if self.recent_ms.len() == BASELINE_WINDOW {
            self.recent_ms.pop_front();
        }
        self.recent_ms.push_back(metric.execution_time_ms);
    }

    fn baseline_ms(&self) -> Option<f64> {
        if self.recent_ms.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.recent_ms.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Some(sorted.iter().sum::<f64>() / sorted.len() as f64)
    }
}

/// Live per-function counters since startup
#[derive(Debug, Clone, Serialize)]
pub struct FunctionStats {
    pub function_name: String,
    pub count: u64,
    pub failures: u64,
    pub baseline_ms: Option<f64>,
}

pub struct PerformanceAggregator {
    db: Arc<MonitorDb>,
    config: Arc<ConfigManager>,
    rolling: DashMap<String, RollingStats>,
}

impl PerformanceAggregator {
    pub fn new(db: Arc<MonitorDb>, config: Arc<ConfigManager>) -> Arc<Self> {
        Arc::new(Self {
            db,
            config,
            rolling: DashMap::new(),
        })
    }

    /// Feed `performance.recorded` events into the rolling accumulators
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> SubscriptionId {
        let aggregator = Arc::downgrade(self);
        bus.subscribe(crate::events::EventType::PerformanceRecorded, move |event: Arc<Event>| {
            if let (Some(aggregator), EventPayload::Performance(metric)) = (aggregator.upgrade(), &event.payload) {
                aggregator.record(metric);
            }
        })
    }

    pub fn record(&self, metric: &PerformanceMetric) {
        self.rolling
            .entry(metric.function_name.clone())
            .or_default()
            .record(metric);
    }

    /// Rolling mean of the last `BASELINE_WINDOW` durations of `function`
    pub fn baseline_ms(&self, function: &str) -> Option<f64> {
        self.rolling.get(function).and_then(|s| s.baseline_ms())
    }

    pub fn function_stats(&self) -> Vec<FunctionStats> {
        let mut stats: Vec<FunctionStats> = self
            .rolling
            .iter()
            .map(|entry| FunctionStats {
                function_name: entry.key().clone(),
                count: entry.count,
                failures: entry.failures,
                baseline_ms: entry.baseline_ms(),
            })
            .collect();
        stats.sort_by(|a, b| a.function_name.cmp(&b.function_name));
        stats
    }

    /// Summaries per function and bucket for every bucket overlapping `range`
    ///
    /// Sealed buckets with a materialised summary are served from the store;
    /// every other bucket is summarised from the raw metrics.
    pub async fn get_performance_summary(
        &self,
        range: &TimeRange,
        granularity: Granularity,
    ) -> Result<Vec<PerformanceSummary>> {
        self.summaries_for(None, range, granularity).await
    }

    /// Like `get_performance_summary`, restricted to one function
    pub async fn function_summary(
        &self,
        function: &str,
        range: &TimeRange,
        granularity: Granularity,
    ) -> Result<Vec<PerformanceSummary>> {
        self.summaries_for(Some(function), range, granularity).await
    }

    async fn summaries_for(
        &self,
        function: Option<&str>,
        range: &TimeRange,
        granularity: Granularity,
    ) -> Result<Vec<PerformanceSummary>> {
        let buckets = buckets_in(range, granularity);
        let (Some(first), Some(last)) = (buckets.first(), buckets.last()) else {
            return Ok(Vec::new());
        };
        let span = TimeRange::new(first.0, last.1);
        let now = Utc::now();

        let mut result: BTreeMap<(DateTime<Utc>, String), PerformanceSummary> = BTreeMap::new();

        for stored in self.db.query_summaries(function, granularity, &span).await? {
            if stored.is_sealed(now) {
                result.insert((stored.bucket_start, stored.function_name.clone()), stored);
            }
        }

        let filter = MetricFilter {
            function_name: function.map(str::to_string),
            time_range: Some(span),
            ..Default::default()
        };
        let raw = self.db.query_metrics(&filter).await?;

        let mut groups: BTreeMap<(DateTime<Utc>, String), Vec<PerformanceMetric>> = BTreeMap::new();
        for metric in raw {
            let (start, end) = bucket_bounds(metric.timestamp, granularity);
            // The span is inclusive; a metric exactly at its end belongs to the next bucket
            if start > last.0 || end <= first.0 {
                continue;
            }
            groups.entry((start, metric.function_name.clone())).or_default().push(metric);
        }

        for ((start, name), metrics) in groups {
            let key = (start, name);
            if result.contains_key(&key) {
                continue;
            }
            let (_, end) = bucket_bounds(start, granularity);
            if let Some(summary) = summarize(&key.1, granularity, start, end, &metrics) {
                result.insert(key, summary);
            }
        }

        Ok(result.into_values().collect())
    }

    /// Regenerate and overwrite stored summaries of sealed buckets in `range`
    pub async fn recompute_summaries(&self, range: &TimeRange, granularity: Granularity) -> Result<u64> {
        let now = Utc::now();
        let mut summaries = Vec::new();

        for (start, end) in buckets_in(range, granularity) {
            if end > now {
                break;
            }
            summaries.extend(summarize_bucket(&self.db, granularity, start, end).await?);
        }

        let written = self.db.store_summaries(&summaries, true).await?;
        tracing::info!(granularity = %granularity, written, "Recomputed performance summaries");
        Ok(written)
    }

    /// Trend of one function across the buckets of `range`
    pub async fn trend(
        &self,
        function: &str,
        range: &TimeRange,
        granularity: Granularity,
        metric: TrendMetric,
    ) -> Result<TrendDirection> {
        let summaries = self.function_summary(function, range, granularity).await?;
        let dead_band = self.config.current().trend_dead_band;
        Ok(detect_trend(&summaries, metric, dead_band))
    }
}

async fn summarize_bucket(
    db: &MonitorDb,
    granularity: Granularity,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<PerformanceSummary>> {
    let mut summaries = Vec::new();
    let start_ms = start.timestamp_millis();
    let end_ms = end.timestamp_millis();

    for function in db.metric_functions_between(start_ms, end_ms).await? {
        // Metric ranges are inclusive; drop the row sitting exactly on the bucket end
        let filter = MetricFilter {
            function_name: Some(function.clone()),
            time_range: Some(TimeRange::new(start, end)),
            ..Default::default()
        };
        let metrics: Vec<PerformanceMetric> = db
            .query_metrics(&filter)
            .await?
            .into_iter()
            .filter(|m| m.timestamp < end)
            .collect();

        if let Some(summary) = summarize(&function, granularity, start, end, &metrics) {
            summaries.push(summary);
        }
    }

    Ok(summaries)
}

/// Materialise every sealed bucket not yet stored, for all granularities
///
/// Resumes after the newest stored bucket of each granularity, so late
/// metrics for an already materialised bucket are not folded in.
pub async fn materialize_sealed(db: &MonitorDb, now: DateTime<Utc>) -> Result<u64> {
    let Some(oldest) = db.oldest_metric_timestamp().await? else {
        return Ok(0);
    };

    let mut written = 0;

    for granularity in Granularity::ALL {
        let resume = db.latest_summary_end(granularity).await?;
        let from = match resume {
            Some(end) if end > oldest => end,
            _ => oldest,
        };

        let (mut start, mut end) = bucket_bounds(from, granularity);
        let mut summaries = Vec::new();

        while end <= now {
            summaries.extend(summarize_bucket(db, granularity, start, end).await?);
            let next = bucket_bounds(end, granularity);
            start = next.0;
            end = next.1;
        }

        written += db.store_summaries(&summaries, false).await?;
    }

    if written > 0 {
        tracing::info!(written, "Materialised sealed performance summaries");
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use chrono::TimeZone;

    fn metric(ts: DateTime<Utc>, function: &str, ms: f64, success: bool) -> PerformanceMetric {
        PerformanceMetric {
            timestamp: ts,
            session_id: "s1".to_string(),
            function_name: function.to_string(),
            execution_time_ms: ms,
            memory_peak_bytes: 2_048,
            cpu_percent: 5.0,
            api_calls: 1,
            db_ops: 0,
            success,
        }
    }

    async fn aggregator() -> (Arc<PerformanceAggregator>, Arc<MonitorDb>) {
        let db = Arc::new(MonitorDb::in_memory().await.unwrap());
        let config = Arc::new(ConfigManager::from_config(MonitorConfig::default()).unwrap());
        (PerformanceAggregator::new(db.clone(), config), db)
    }

    #[tokio::test]
    async fn test_summary_from_raw_metrics() {
        let (agg, db) = aggregator().await;
        let day = Utc.with_ymd_and_hms(2026, 2, 10, 9, 0, 0).unwrap();
        db.insert_metrics(&[
            metric(day, "score", 10.0, true),
            metric(day, "score", 20.0, false),
            metric(day, "score", 30.0, true),
            metric(day, "fetch", 5.0, true),
        ])
        .await
        .unwrap();

        let range = TimeRange::new(day, day);
        let summaries = agg.get_performance_summary(&range, Granularity::Day).await.unwrap();
        assert_eq!(summaries.len(), 2);

        let score = summaries.iter().find(|s| s.function_name == "score").unwrap();
        assert_eq!(score.count, 3);
        assert_eq!(score.success_rate, 2.0 / 3.0);
        assert_eq!(score.mean_ms, 20.0);
    }

    #[tokio::test]
    async fn test_materialized_summary_matches_live_summary() {
        let (agg, db) = aggregator().await;
        let day = Utc.with_ymd_and_hms(2026, 2, 10, 9, 0, 0).unwrap();
        db.insert_metrics(&[
            metric(day, "score", 0.1, true),
            metric(day, "score", 0.2, true),
            metric(day, "score", 0.7, false),
        ])
        .await
        .unwrap();

        let range = TimeRange::new(day, day);
        let live = agg.get_performance_summary(&range, Granularity::Day).await.unwrap();

        let now = Utc.with_ymd_and_hms(2026, 2, 20, 0, 0, 0).unwrap();
        assert!(materialize_sealed(&db, now).await.unwrap() >= 1);

        let (start, _) = bucket_bounds(day, Granularity::Day);
        let stored = db.get_summary("score", Granularity::Day, start).await.unwrap().unwrap();
        assert_eq!(stored, live[0]);
    }

    #[tokio::test]
    async fn test_materialize_is_resumable() {
        let (_, db) = aggregator().await;
        let day = Utc.with_ymd_and_hms(2026, 2, 10, 9, 0, 0).unwrap();
        db.insert_metrics(&[metric(day, "score", 10.0, true)]).await.unwrap();

        let now = Utc.with_ymd_and_hms(2026, 3, 20, 0, 0, 0).unwrap();
        let first = materialize_sealed(&db, now).await.unwrap();
        // day + week + month
        assert_eq!(first, 3);
        assert_eq!(materialize_sealed(&db, now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recompute_overwrites_stored_summary() {
        let (agg, db) = aggregator().await;
        let day = Utc.with_ymd_and_hms(2026, 2, 10, 9, 0, 0).unwrap();
        db.insert_metrics(&[metric(day, "score", 10.0, true)]).await.unwrap();
        materialize_sealed(&db, Utc.with_ymd_and_hms(2026, 2, 12, 0, 0, 0).unwrap())
            .await
            .unwrap();

        // A late metric is not folded in until an explicit recompute
        db.insert_metrics(&[metric(day, "score", 30.0, true)]).await.unwrap();
        let range = TimeRange::new(day, day);
        let served = agg.get_performance_summary(&range, Granularity::Day).await.unwrap();
        assert_eq!(served[0].count, 1);

        agg.recompute_summaries(&range, Granularity::Day).await.unwrap();
        let served = agg.get_performance_summary(&range, Granularity::Day).await.unwrap();
        assert_eq!(served[0].count, 2);
        assert_eq!(served[0].mean_ms, 20.0);
    }

    #[tokio::test]
    async fn test_baseline_is_rolling_mean() {
        let (agg, _) = aggregator().await;
        let now = Utc::now();
        for ms in [10.0, 20.0, 30.0] {
            agg.record(&metric(now, "fetch", ms, true));
        }
        assert_eq!(agg.baseline_ms("fetch"), Some(20.0));
        assert_eq!(agg.baseline_ms("unknown"), None);

        for _ in 0..BASELINE_WINDOW {
            agg.record(&metric(now, "fetch", 50.0, true));
        }
        assert_eq!(agg.baseline_ms("fetch"), Some(50.0));
        assert_eq!(agg.function_stats()[0].count, 3 + BASELINE_WINDOW as u64);
    }
}
