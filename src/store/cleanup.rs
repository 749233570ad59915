//! Retention sweep for stored monitoring data
//!
//! A sweep first materialises summaries for every sealed bucket, then deletes
//! raw rows past the detailed window and summaries past the summary window.

use super::database::{CleanupStats, MonitorDb};
use super::text_log::TextLogMirror;
use crate::config::{ConfigManager, MonitorConfig};
use crate::error::Result;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

/// Retention windows, in days
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub log_retention_days: i64,
    pub summary_retention_days: i64,
}

impl RetentionPolicy {
    pub fn from_config(cfg: &MonitorConfig) -> Self {
        Self {
            log_retention_days: cfg.log_retention_days,
            summary_retention_days: cfg.summary_retention_days,
        }
    }

    pub fn log_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::days(self.log_retention_days)
    }

    pub fn summary_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::days(self.summary_retention_days)
    }
}

/// Cleanup configuration
#[derive(Debug, Clone, Copy)]
pub struct CleanupConfig {
    /// Check interval (how often to check if it's cleanup time)
    pub check_interval: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(3600), // Check every hour
        }
    }
}

/// Spawn background cleanup task
///
/// Once a day, during the hour named by `cleanupHour` in the current config
/// snapshot, the task runs a full sweep with the snapshot's retention windows.
pub fn spawn_cleanup_task(
    db: Arc<MonitorDb>,
    mirror: Option<Arc<TextLogMirror>>,
    config: Arc<ConfigManager>,
    cleanup: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        cleanup_loop(db, mirror, config, cleanup).await;
    })
}

/// Main cleanup loop
/// The sweep runs once per UTC day, during `cleanup_hour` (UTC)
fn cleanup_due(now: DateTime<Utc>, cleanup_hour: u32, last_cleanup_day: Option<NaiveDate>) -> bool {
    now.hour() == cleanup_hour && last_cleanup_day != Some(now.date_naive())
}

async fn cleanup_loop(
    db: Arc<MonitorDb>,
    mirror: Option<Arc<TextLogMirror>>,
    config: Arc<ConfigManager>,
    cleanup: CleanupConfig,
) {
    // First check one interval after startup, not immediately
    let mut interval = time::interval_at(time::Instant::now() + cleanup.check_interval, cleanup.check_interval);
    let mut last_cleanup_day: Option<NaiveDate> = None;

    loop {
        interval.tick().await;

        let cfg = config.current();
        let now = Utc::now();
        let current_day = now.date_naive();

        if cleanup_due(now, cfg.cleanup_hour, last_cleanup_day) {
            tracing::info!(cleanup_hour = cfg.cleanup_hour, "Starting scheduled cleanup");

            let policy = RetentionPolicy::from_config(&cfg);
            match sweep(&db, mirror.as_deref(), &policy, now).await {
                Ok(stats) => {
                    log_stats(&stats, "Cleanup completed successfully");
                    last_cleanup_day = Some(current_day);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Cleanup failed");
                }
            }
        }
    }
}

/// Run a sweep immediately (manual trigger, shutdown, tests)
pub async fn run_cleanup_now(
    db: &MonitorDb,
    mirror: Option<&TextLogMirror>,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<CleanupStats> {
    tracing::info!("Running manual cleanup");

    let stats = sweep(db, mirror, policy, now).await?;
    log_stats(&stats, "Manual cleanup completed");

    Ok(stats)
}

async fn sweep(
    db: &MonitorDb,
    mirror: Option<&TextLogMirror>,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<CleanupStats> {
    // Summaries must exist before the raw rows they are built from go away
    let summaries_materialized = crate::aggregator::materialize_sealed(db, now).await?;

    let log_cutoff = policy.log_cutoff(now);
    let summary_cutoff = policy.summary_cutoff(now);

    let mut stats = db
        .delete_expired(log_cutoff.timestamp_millis(), summary_cutoff.timestamp_millis())
        .await?;
    stats.summaries_materialized = summaries_materialized;

    if let Some(mirror) = mirror {
        stats.text_logs_deleted = mirror.delete_before(log_cutoff.date_naive())?;
    }

    Ok(stats)
}

fn log_stats(stats: &CleanupStats, message: &str) {
    tracing::info!(
        log_entries_deleted = stats.log_entries_deleted,
        metrics_deleted = stats.metrics_deleted,
        summaries_deleted = stats.summaries_deleted,
        summaries_materialized = stats.summaries_materialized,
        text_logs_deleted = stats.text_logs_deleted,
        "{}",
        message
    );
}
