//! Monitoring core wiring
//!
//! A [`Monitor`] owns one of each component and connects them through the bus.
//! It is built explicitly and handed to the code that needs it.

use crate::aggregator::{FunctionStats, Granularity, PerformanceAggregator, PerformanceSummary};
use crate::alerts::{AlertEngine, AlertNotification};
use crate::bus::EventBus;
use crate::config::{ConfigManager, MonitorConfig};
use crate::error::Result;
use crate::events::{Event, EventType};
use crate::instrument::{Instrument, ResourceSampler};
use crate::progress::{ProgressState, ProgressTracker, SessionPlan};
use crate::store::{
    export_entries, import_entries, run_cleanup_now, spawn_cleanup_task, AsyncWriter, CleanupConfig, CleanupStats,
    DatabaseStats, ExportFormat, LogEntry, LogFilter, MonitorDb, RetentionPolicy, TextLogMirror, TimeRange,
    WriterSettings, WriterStatsSnapshot,
};
use crate::LogLevelHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct MonitorOptions {
    /// Follow `logLevel` changes through this handle
    pub log_level: Option<LogLevelHandle>,
    pub cleanup: CleanupConfig,
    /// How often the config file's mtime is polled; `None` disables the watcher
    pub config_poll_interval: Option<Duration>,
    /// Mirror persisted entries into the daily text log
    pub text_mirror: bool,
    /// Run a retention sweep during shutdown
    pub final_sweep: bool,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            log_level: None,
            cleanup: CleanupConfig::default(),
            config_poll_interval: Some(Duration::from_secs(5)),
            text_mirror: true,
            final_sweep: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub database: DatabaseStats,
    pub writer: WriterStatsSnapshot,
    pub active_sessions: Vec<ProgressState>,
    pub functions: Vec<FunctionStats>,
    pub recent_alerts: Vec<AlertNotification>,
    pub delivery_failures: usize,
    pub alert_rules: usize,
}

pub struct Monitor {
    config: Arc<ConfigManager>,
    bus: Arc<EventBus>,
    db: Arc<MonitorDb>,
    mirror: Option<Arc<TextLogMirror>>,
    writer: Arc<AsyncWriter>,
    aggregator: Arc<PerformanceAggregator>,
    progress: Arc<ProgressTracker>,
    alerts: Arc<AlertEngine>,
    sampler: Arc<ResourceSampler>,
    final_sweep: bool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: DateTime<Utc>,
    stopped: AtomicBool,
}

impl Monitor {
    pub async fn start(config: Arc<ConfigManager>) -> Result<Arc<Self>> {
        Self::start_with(config, MonitorOptions::default(), AlertEngine::new).await
    }

    /// Start with explicit options; `alerts` builds the alert engine so callers
    /// can swap channels or the retry policy
    pub async fn start_with<F>(config: Arc<ConfigManager>, options: MonitorOptions, alerts: F) -> Result<Arc<Self>>
    where
        F: FnOnce(Arc<ConfigManager>) -> AlertEngine,
    {
        let cfg = config.current();

        let db = Arc::new(MonitorDb::new(&cfg.database_url()).await?);
        let mirror = if options.text_mirror {
            Some(Arc::new(TextLogMirror::new(&cfg.text_log_path)?))
        } else {
            None
        };

        let bus = EventBus::spawn();
        let writer = AsyncWriter::spawn(db.clone(), &bus, mirror.clone(), WriterSettings::from_config(&cfg));
        let aggregator = PerformanceAggregator::new(db.clone(), config.clone());
        let progress = ProgressTracker::new(&bus);
        let alerts = Arc::new(alerts(config.clone()));

        writer.attach(&bus);
        aggregator.attach(&bus);
        progress.attach(&bus);
        alerts.attach(&bus);

        let mut tasks = vec![spawn_cleanup_task(
            db.clone(),
            mirror.clone(),
            config.clone(),
            options.cleanup,
        )];
        if let Some(interval) = options.config_poll_interval {
            if let Some(handle) = config.clone().spawn_watcher(interval) {
                tasks.push(handle);
            }
        }
        tasks.push(spawn_config_listener(&config, &bus, options.log_level));

        crate::metrics::init_metric_descriptions();

        let monitor = Arc::new(Self {
            config,
            bus,
            db,
            mirror,
            writer,
            aggregator,
            progress,
            alerts,
            sampler: Arc::new(ResourceSampler::new()),
            final_sweep: options.final_sweep,
            tasks: Mutex::new(tasks),
            started_at: Utc::now(),
            stopped: AtomicBool::new(false),
        });

        monitor.bus.publish(Event::system(
            EventType::SystemStartup,
            serde_json::json!({
                "storagePath": cfg.storage_path,
                "alertRules": cfg.alert_rules().len(),
            }),
        ));
        tracing::info!(storage = %cfg.storage_path.display(), "Monitor started");

        Ok(monitor)
    }

    /// Builder for instrumenting `function_name`
    pub fn instrument(&self, function_name: impl Into<String>) -> Instrument {
        Instrument::new(
            self.bus.clone(),
            self.sampler.clone(),
            self.config.current().max_snapshot_bytes,
            function_name,
        )
    }

    /// Execution, performance and progress tracking in one builder
    pub fn monitor_all(&self, function_name: impl Into<String>, session_id: impl Into<String>, weight: f64) -> Instrument {
        self.instrument(function_name)
            .track_execution()
            .track_performance()
            .progress_step(session_id, weight)
    }

    pub fn start_session(&self, session_id: &str, plan: SessionPlan) -> Result<ProgressState> {
        self.progress.start_session(session_id, plan)
    }

    pub fn abort_session(&self, session_id: &str) -> Result<ProgressState> {
        self.progress.abort(session_id)
    }

    pub fn get_current_progress(&self, session_id: &str) -> Option<ProgressState> {
        self.progress.get_current_progress(session_id)
    }

    /// Wait until everything published so far is persisted
    pub async fn flush(&self) {
        // Handlers may publish follow-up events (progress updates), hence twice
        self.bus.flush().await;
        self.bus.flush().await;
        self.writer.flush().await;
    }

    pub async fn query_logs(&self, filter: &LogFilter) -> Result<Vec<LogEntry>> {
        self.db.query_logs(filter).await
    }

    pub async fn get_performance_summary(
        &self,
        range: &TimeRange,
        granularity: Granularity,
    ) -> Result<Vec<PerformanceSummary>> {
        self.aggregator.get_performance_summary(range, granularity).await
    }

    /// Entries inside `range` rendered in `format`
    pub async fn export_data(&self, format: ExportFormat, range: TimeRange) -> Result<Vec<u8>> {
        let entries = self
            .db
            .query_logs(&LogFilter {
                time_range: Some(range),
                ..Default::default()
            })
            .await?;

        let mut out = Vec::new();
        let written = export_entries(&entries, format, &mut out)?;
        tracing::info!(format = ?format, entries = written, "Exported log entries");
        Ok(out)
    }

    pub fn import_data(&self, format: ExportFormat, bytes: &[u8]) -> Result<Vec<LogEntry>> {
        import_entries(bytes, format)
    }

    /// Retention sweep with the active windows, right now
    pub async fn cleanup_now(&self) -> Result<CleanupStats> {
        let policy = RetentionPolicy::from_config(&self.config.current());
        run_cleanup_now(&self.db, self.mirror.as_deref(), &policy, Utc::now()).await
    }

    pub async fn status(&self) -> Result<MonitorStatus> {
        let now = Utc::now();
        Ok(MonitorStatus {
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds(),
            database: self.db.get_stats().await?,
            writer: self.writer.stats(),
            active_sessions: self.progress.active_sessions(),
            functions: self.aggregator.function_stats(),
            recent_alerts: self.alerts.recent_alerts(20),
            delivery_failures: self.alerts.delivery_failures().len(),
            alert_rules: self.config.current().alert_rules().len(),
        })
    }

    pub fn config(&self) -> Arc<MonitorConfig> {
        self.config.current()
    }

    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn db(&self) -> &Arc<MonitorDb> {
        &self.db
    }

    pub fn aggregator(&self) -> &Arc<PerformanceAggregator> {
        &self.aggregator
    }

    pub fn alerts(&self) -> &Arc<AlertEngine> {
        &self.alerts
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    /// Stop the core: persist what is queued, sweep, detach everything
    ///
    /// Calling it more than once is a no-op. Queries keep working afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("Shutting down monitor");

        self.bus.publish(Event::system(
            EventType::SystemShutdown,
            serde_json::json!({ "uptimeSecs": (Utc::now() - self.started_at).num_seconds() }),
        ));
        self.bus.flush().await;
        self.bus.flush().await;
        self.writer.shutdown().await;
        self.alerts.wait_for_deliveries().await;

        let sweep = if self.final_sweep {
            self.cleanup_now().await.map(|_| ())
        } else {
            Ok(())
        };

        self.bus.clear_subscribers();
        self.bus.shutdown().await;

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }

        if let Err(e) = &sweep {
            tracing::error!(error = %e, "Final retention sweep failed");
        }
        tracing::info!("Monitor stopped");
        sweep
    }
}

/// Announce every newly activated config and follow its log level
fn spawn_config_listener(
    config: &ConfigManager,
    bus: &Arc<EventBus>,
    log_level: Option<LogLevelHandle>,
) -> JoinHandle<()> {
    let mut updates = config.subscribe();
    let bus = Arc::downgrade(bus);

    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let cfg = updates.borrow_and_update().clone();

            if let Some(handle) = &log_level {
                if let Err(e) = crate::set_log_level(handle, &cfg.log_level) {
                    tracing::warn!(error = %e, "Keeping previous log level");
                }
            }

            let Some(bus) = bus.upgrade() else {
                break;
            };
            bus.publish(Event::system(
                EventType::ConfigReloaded,
                serde_json::json!({
                    "logLevel": cfg.log_level,
                    "alertRules": cfg.alert_rules().len(),
                }),
            ));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn monitor() -> Arc<Monitor> {
        let cfg = MonitorConfig {
            storage_path: ":memory:".into(),
            ..Default::default()
        };
        let manager = Arc::new(ConfigManager::from_config(cfg).unwrap());
        let options = MonitorOptions {
            text_mirror: false,
            config_poll_interval: None,
            ..Default::default()
        };
        Monitor::start_with(manager, options, AlertEngine::new).await.unwrap()
    }

    #[tokio::test]
    async fn test_startup_and_shutdown_are_persisted() {
        let monitor = monitor().await;
        monitor.shutdown().await.unwrap();
        monitor.shutdown().await.unwrap();

        let entries = monitor.query_logs(&LogFilter::default()).await.unwrap();
        let types: Vec<EventType> = entries.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![EventType::SystemStartup, EventType::SystemShutdown]);
    }

    #[tokio::test]
    async fn test_config_reload_is_announced() {
        let monitor = monitor().await;
        let mut cfg = (*monitor.config()).clone();
        cfg.log_level = "debug".to_string();
        monitor.config_manager().apply(cfg).unwrap();

        // The listener publishes from its own task
        let mut seen = false;
        for _ in 0..50 {
            monitor.flush().await;
            let entries = monitor
                .query_logs(&LogFilter {
                    event_type: Some(EventType::ConfigReloaded),
                    ..Default::default()
                })
                .await
                .unwrap();
            if !entries.is_empty() {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen);
        monitor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_counts_sessions_and_functions() {
        let monitor = monitor().await;
        monitor.start_session("s", SessionPlan::steps(2)).unwrap();

        let step = monitor.monitor_all("score", "s", 1.0);
        let _: std::result::Result<u8, String> = step.call(|| Ok(1));
        monitor.flush().await;

        let status = monitor.status().await.unwrap();
        assert_eq!(status.active_sessions.len(), 1);
        assert_eq!(status.active_sessions[0].percent, 50.0);
        assert_eq!(status.functions.len(), 1);
        assert_eq!(status.functions[0].count, 1);
        assert_eq!(status.alert_rules, 3);
        monitor.shutdown().await.unwrap();
    }
}
