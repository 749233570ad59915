use super::PerformanceSummary;
use serde::{Deserialize, Serialize};

/// Which series of a summary a trend is computed over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendMetric {
    MeanLatency,
    P90Latency,
    SuccessRate,
}

impl TrendMetric {
    fn value(&self, summary: &PerformanceSummary) -> f64 {
        match self {
            Self::MeanLatency => summary.mean_ms,
            Self::P90Latency => summary.p90_ms,
            Self::SuccessRate => summary.success_rate,
        }
    }

    /// Whether a rising series is bad news
    fn higher_is_worse(&self) -> bool {
        !matches!(self, Self::SuccessRate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Stable,
    Regressing,
}

/// Least-squares slope of `values` against their index
///
/// `None` with fewer than two points.
pub fn linear_slope(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 2 {
        return None;
    }

    let n_f = n as f64;
    let mean_x = (n_f - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n_f;

    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }

    Some(num / den)
}

/// Slope relative to the series mean, so the dead band is scale-free
pub fn relative_slope(values: &[f64]) -> Option<f64> {
    let slope = linear_slope(values)?;
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    if mean.abs() < f64::EPSILON {
        return Some(0.0);
    }
    Some(slope / mean.abs())
}

/// Classify the trend of `summaries` (ordered oldest first)
///
/// A relative slope inside `±dead_band` is stable. Fewer than two buckets is
/// always stable.
pub fn detect_trend(summaries: &[PerformanceSummary], metric: TrendMetric, dead_band: f64) -> TrendDirection {
    let values: Vec<f64> = summaries.iter().map(|s| metric.value(s)).collect();

    let Some(rel) = relative_slope(&values) else {
        return TrendDirection::Stable;
    };

    if rel.abs() <= dead_band {
        TrendDirection::Stable
    } else if (rel > 0.0) == metric.higher_is_worse() {
        TrendDirection::Regressing
    } else {
        TrendDirection::Improving
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{summarize, Granularity, PerformanceMetric};
    use chrono::{Duration, TimeZone, Utc};

    fn series(latencies: &[f64], success: &[bool]) -> Vec<PerformanceSummary> {
        let base = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        latencies
            .iter()
            .zip(success)
            .enumerate()
            .filter_map(|(i, (&ms, &ok))| {
                let start = base + Duration::days(i as i64);
                let metric = PerformanceMetric {
                    timestamp: start,
                    session_id: "s".to_string(),
                    function_name: "fetch".to_string(),
                    execution_time_ms: ms,
                    memory_peak_bytes: 0,
                    cpu_percent: 0.0,
                    api_calls: 0,
                    db_ops: 0,
                    success: ok,
                };
                summarize("fetch", Granularity::Day, start, start + Duration::days(1), &[metric])
            })
            .collect()
    }

    #[test]
    fn test_linear_slope() {
        assert_eq!(linear_slope(&[1.0, 2.0, 3.0]), Some(1.0));
        assert_eq!(linear_slope(&[5.0, 5.0, 5.0]), Some(0.0));
        assert_eq!(linear_slope(&[1.0]), None);
    }

    #[test]
    fn test_rising_latency_is_regressing() {
        let s = series(&[100.0, 120.0, 150.0, 190.0], &[true; 4]);
        assert_eq!(detect_trend(&s, TrendMetric::MeanLatency, 0.05), TrendDirection::Regressing);
    }

    #[test]
    fn test_falling_latency_is_improving() {
        let s = series(&[190.0, 150.0, 120.0, 100.0], &[true; 4]);
        assert_eq!(detect_trend(&s, TrendMetric::P90Latency, 0.05), TrendDirection::Improving);
    }

    #[test]
    fn test_small_wobble_is_stable() {
        let s = series(&[100.0, 101.0, 99.5, 100.5], &[true; 4]);
        assert_eq!(detect_trend(&s, TrendMetric::MeanLatency, 0.05), TrendDirection::Stable);
    }

    #[test]
    fn test_rising_success_rate_is_improving() {
        let s = series(&[1.0, 1.0, 1.0], &[false, false, true]);
        assert_eq!(detect_trend(&s, TrendMetric::SuccessRate, 0.05), TrendDirection::Improving);
    }

    #[test]
    fn test_single_bucket_is_stable() {
        let s = series(&[100.0], &[true]);
        assert_eq!(detect_trend(&s, TrendMetric::MeanLatency, 0.0), TrendDirection::Stable);
    }
}
