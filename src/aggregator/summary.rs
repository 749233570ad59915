//! Deterministic bucket summaries
//!
//! `summarize` is the only place summaries are computed, whether for a live
//! query or for materialisation, so a stored summary and a recomputed one are
//! bit-identical for the same metrics.

use super::PerformanceMetric;
use crate::store::TimeRange;
use chrono::{DateTime, Datelike, Months, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Week,
    Month,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Granularity::Day, Granularity::Week, Granularity::Month];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" | "daily" => Ok(Self::Day),
            "week" | "weekly" => Ok(Self::Week),
            "month" | "monthly" => Ok(Self::Month),
            other => Err(format!("unknown granularity: {}", other)),
        }
    }
}

/// `[start, end)` of the bucket containing `ts`
///
/// Days start at UTC midnight, weeks on ISO Monday, months on the first.
pub fn bucket_bounds(ts: DateTime<Utc>, granularity: Granularity) -> (DateTime<Utc>, DateTime<Utc>) {
    let date = ts.date_naive();

    let (start, end) = match granularity {
        Granularity::Day => (date, date + chrono::Duration::days(1)),
        Granularity::Week => {
            let monday = date - chrono::Duration::days(date.weekday().num_days_from_monday() as i64);
            (monday, monday + chrono::Duration::days(7))
        }
        Granularity::Month => {
            let first = date - chrono::Duration::days(date.day0() as i64);
            (first, first + Months::new(1))
        }
    };

    (start.and_time(NaiveTime::MIN).and_utc(), end.and_time(NaiveTime::MIN).and_utc())
}

/// Every bucket overlapping `range`, oldest first
pub fn buckets_in(range: &TimeRange, granularity: Granularity) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut buckets = Vec::new();
    let (mut start, mut end) = bucket_bounds(range.start, granularity);

    while start <= range.end {
        buckets.push((start, end));
        let next = bucket_bounds(end, granularity);
        start = next.0;
        end = next.1;
    }

    buckets
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub function_name: String,
    pub granularity: Granularity,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub count: u64,
    pub success_count: u64,
    pub success_rate: f64,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
    pub std_dev_ms: f64,
    pub mean_memory_bytes: f64,
    pub max_memory_bytes: u64,
    pub mean_cpu_percent: f64,
    pub total_api_calls: u64,
    pub total_db_ops: u64,
}

impl PerformanceSummary {
    /// A bucket is sealed once its end lies at or before `now`
    pub fn is_sealed(&self, now: DateTime<Utc>) -> bool {
        self.bucket_end <= now
    }
}

/// Summarise `metrics` for one function and bucket
///
/// Input order does not matter: values are sorted before any sum is taken.
/// Returns `None` for an empty bucket.
pub fn summarize(
    function_name: &str,
    granularity: Granularity,
    bucket_start: DateTime<Utc>,
    bucket_end: DateTime<Utc>,
    metrics: &[PerformanceMetric],
) -> Option<PerformanceSummary> {
    if metrics.is_empty() {
        return None;
    }

    let n = metrics.len();

    let mut durations: Vec<f64> = metrics.iter().map(|m| m.execution_time_ms).collect();
    durations.sort_by(|a, b| a.total_cmp(b));

    let mut cpu: Vec<f64> = metrics.iter().map(|m| m.cpu_percent).collect();
    cpu.sort_by(|a, b| a.total_cmp(b));

    let mean_ms = durations.iter().sum::<f64>() / n as f64;
    let variance = durations.iter().map(|d| (d - mean_ms) * (d - mean_ms)).sum::<f64>() / n as f64;

    let memory_total: u128 = metrics.iter().map(|m| m.memory_peak_bytes as u128).sum();
    let success_count = metrics.iter().filter(|m| m.success).count() as u64;

    Some(PerformanceSummary {
        function_name: function_name.to_string(),
        granularity,
        bucket_start,
        bucket_end,
        count: n as u64,
        success_count,
        success_rate: success_count as f64 / n as f64,
        mean_ms,
        min_ms: durations[0],
        max_ms: durations[n - 1],
        p50_ms: nearest_rank(&durations, 50.0),
        p90_ms: nearest_rank(&durations, 90.0),
        p99_ms: nearest_rank(&durations, 99.0),
        std_dev_ms: variance.sqrt(),
        mean_memory_bytes: memory_total as f64 / n as f64,
        max_memory_bytes: metrics.iter().map(|m| m.memory_peak_bytes).max().unwrap_or(0),
        mean_cpu_percent: cpu.iter().sum::<f64>() / n as f64,
        total_api_calls: metrics.iter().map(|m| m.api_calls).sum(),
        total_db_ops: metrics.iter().map(|m| m.db_ops).sum(),
    })
}

/// Nearest-rank percentile of an ascending, non-empty slice
fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
