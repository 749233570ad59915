//! Async batch writer for the store
//!
//! This module provides non-blocking persistence with:
//! - Batched inserts (`batch_size` entries or `flush_interval` window)
//! - Bounded exponential backoff on failed batches
//! - An emergency log plus a `system.persistence_failed` event once retries run out
//! - A text mirror of every entry

use super::database::MonitorDb;
use super::text_log::TextLogMirror;
use super::LogEntry;
use crate::aggregator::PerformanceMetric;
use crate::bus::{EventBus, SubscriptionId};
use crate::config::MonitorConfig;
use crate::events::{Event, EventPayload, EventType};
use crate::retry::{retry_with_backoff, RetryPolicy};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Message types for the async writer
#[derive(Debug)]
enum WriterMessage {
    Entry(LogEntry),
    Metric(PerformanceMetric),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry: RetryPolicy,
    pub emergency_log: PathBuf,
}

impl WriterSettings {
    pub fn from_config(cfg: &MonitorConfig) -> Self {
        Self {
            batch_size: cfg.writer.batch_size.max(1),
            flush_interval: cfg.writer.flush_interval(),
            retry: RetryPolicy::new(cfg.writer.max_retries, Duration::from_millis(cfg.writer.retry_base_ms)),
            emergency_log: cfg.emergency_log_path(),
        }
    }
}

/// Running totals, exposed through the monitor status
#[derive(Debug, Default)]
pub struct WriterStats {
    pub entries_written: AtomicU64,
    pub metrics_written: AtomicU64,
    pub failed_batches: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct WriterStatsSnapshot {
    pub entries_written: u64,
    pub metrics_written: u64,
    pub failed_batches: u64,
}

/// Async writer handle
///
/// Sends are non-blocking; the actual writes happen in a background task.
pub struct AsyncWriter {
    sender: mpsc::UnboundedSender<WriterMessage>,
    stats: Arc<WriterStats>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct WriterTask {
    db: Arc<MonitorDb>,
    bus: Weak<EventBus>,
    mirror: Option<Arc<TextLogMirror>>,
    settings: WriterSettings,
    stats: Arc<WriterStats>,
}

impl AsyncWriter {
    /// Spawn a new async writer task
    ///
    /// # Example
    ///
    /// ```ignore
    /// let writer = AsyncWriter::spawn(db, &bus, Some(mirror), WriterSettings::from_config(&cfg));
    /// writer.attach(&bus);
    /// ```
    pub fn spawn(
        db: Arc<MonitorDb>,
        bus: &Arc<EventBus>,
        mirror: Option<Arc<TextLogMirror>>,
        settings: WriterSettings,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(WriterStats::default());

        let task = WriterTask {
            db,
            bus: Arc::downgrade(bus),
            mirror,
            settings,
            stats: stats.clone(),
        };
        let handle = tokio::spawn(task.run(rx));

        Arc::new(Self {
            sender: tx,
            stats,
            task: Mutex::new(Some(handle)),
        })
    }

    /// Subscribe to the bus: function and step-failure events become entries,
    /// performance events become metric rows
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> SubscriptionId {
        let writer = Arc::downgrade(self);
        bus.subscribe_all(move |event: Arc<Event>| {
            let Some(writer) = writer.upgrade() else {
                return;
            };
            match (&event.event_type, &event.payload) {
                (EventType::PerformanceRecorded, EventPayload::Performance(metric)) => {
                    writer.write_metric(metric.clone());
                }
                _ => {
                    if let Some(entry) = LogEntry::from_event(&event) {
                        writer.write_entry(entry);
                    }
                }
            }
        })
    }

    pub fn write_entry(&self, entry: LogEntry) {
        let _ = self.sender.send(WriterMessage::Entry(entry));
    }

    pub fn write_metric(&self, metric: PerformanceMetric) {
        let _ = self.sender.send(WriterMessage::Metric(metric));
    }

    /// Wait until everything sent before this call has been written (or
    /// diverted to the emergency log)
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(WriterMessage::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Flush pending batches and stop the background task
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(WriterMessage::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
        let handle = self.task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn stats(&self) -> WriterStatsSnapshot {
        WriterStatsSnapshot {
            entries_written: self.stats.entries_written.load(Ordering::Relaxed),
            metrics_written: self.stats.metrics_written.load(Ordering::Relaxed),
            failed_batches: self.stats.failed_batches.load(Ordering::Relaxed),
        }
    }
}

impl WriterTask {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<WriterMessage>) {
        let batch_size = self.settings.batch_size;
        let mut entry_batch: Vec<LogEntry> = Vec::with_capacity(batch_size);
        let mut metric_batch: Vec<PerformanceMetric> = Vec::with_capacity(batch_size);

        let mut flush_timer = tokio::time::interval(self.settings.flush_interval);
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(WriterMessage::Entry(entry)) => {
                        entry_batch.push(entry);
                        if entry_batch.len() >= batch_size {
                            self.flush_entries(&mut entry_batch).await;
                        }
                    }
                    Some(WriterMessage::Metric(metric)) => {
                        metric_batch.push(metric);
                        if metric_batch.len() >= batch_size {
                            self.flush_metrics(&mut metric_batch).await;
                        }
                    }
                    Some(WriterMessage::Flush(done)) => {
                        self.flush_entries(&mut entry_batch).await;
                        self.flush_metrics(&mut metric_batch).await;
                        let _ = done.send(());
                    }
                    Some(WriterMessage::Shutdown(done)) => {
                        self.flush_entries(&mut entry_batch).await;
                        self.flush_metrics(&mut metric_batch).await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.flush_entries(&mut entry_batch).await;
                        self.flush_metrics(&mut metric_batch).await;
                        break;
                    }
                },

                // Periodic flush (even if batch not full)
                _ = flush_timer.tick() => {
                    self.flush_entries(&mut entry_batch).await;
                    self.flush_metrics(&mut metric_batch).await;
                }
            }
        }

        tracing::info!("Store writer task shutting down");
    }

    async fn flush_entries(&self, batch: &mut Vec<LogEntry>) {
        if batch.is_empty() {
            return;
        }

        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.append(batch) {
                tracing::warn!(error = %e, "Failed to append to text log mirror");
            }
        }

        let count = batch.len();
        let start = Instant::now();
        let db: &MonitorDb = &self.db;
        let entries: &[LogEntry] = batch;

        let result = retry_with_backoff(self.settings.retry, "insert_log_entries", move |_| {
            db.insert_log_entries(entries)
        })
        .await;

        match result {
            Ok(_) => {
                let elapsed = start.elapsed();
                tracing::debug!(count, duration_ms = elapsed.as_millis() as u64, "Flushed entry batch");
                self.stats.entries_written.fetch_add(count as u64, Ordering::Relaxed);
                crate::metrics::record_persisted("log_entries", count as u64);
                crate::metrics::record_batch_flush("log_entries", elapsed);
            }
            Err(e) => self.divert("log_entries", batch.as_slice(), &e.to_string()),
        }

        batch.clear();
    }

    async fn flush_metrics(&self, batch: &mut Vec<PerformanceMetric>) {
        if batch.is_empty() {
            return;
        }

        let count = batch.len();
        let start = Instant::now();
        let db: &MonitorDb = &self.db;
        let metrics: &[PerformanceMetric] = batch;

        let result = retry_with_backoff(self.settings.retry, "insert_metrics", move |_| db.insert_metrics(metrics)).await;

        match result {
            Ok(()) => {
                let elapsed = start.elapsed();
                tracing::debug!(count, duration_ms = elapsed.as_millis() as u64, "Flushed metric batch");
                self.stats.metrics_written.fetch_add(count as u64, Ordering::Relaxed);
                crate::metrics::record_persisted("performance_metrics", count as u64);
                crate::metrics::record_batch_flush("performance_metrics", elapsed);
            }
            Err(e) => self.divert("performance_metrics", batch.as_slice(), &e.to_string()),
        }

        batch.clear();
    }

    /// Write a batch that could not be stored to the emergency log and report it
    fn divert<T: Serialize>(&self, table: &'static str, records: &[T], error: &str) {
        self.stats.failed_batches.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_persistence_failure(table);

        tracing::error!(
            table,
            count = records.len(),
            error,
            path = %self.settings.emergency_log.display(),
            "Persistence failed after retries, writing to emergency log"
        );

        if let Err(e) = append_emergency(&self.settings.emergency_log, table, records) {
            tracing::error!(error = %e, "Failed to write emergency log");
        }

        if let Some(bus) = self.bus.upgrade() {
            bus.publish(Event::system(
                EventType::PersistenceFailed,
                serde_json::json!({
                    "table": table,
                    "count": records.len(),
                    "error": error,
                    "emergency_log": self.settings.emergency_log.display().to_string(),
                }),
            ));
        }
    }
}

#[derive(Serialize)]
struct EmergencyRecord<'a, T> {
    table: &'a str,
    record: &'a T,
}

fn append_emergency<T: Serialize>(path: &Path, table: &str, records: &[T]) -> crate::error::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;

    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, &EmergencyRecord { table, record })?;
        buf.push(b'\n');
    }
    file.write_all(&buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::new_invocation_id;
    use crate::store::LogFilter;

    async fn create_test_db() -> Arc<MonitorDb> {
        Arc::new(MonitorDb::in_memory().await.unwrap())
    }

    fn settings(dir: &std::path::Path, batch_size: usize, flush_interval: Duration) -> WriterSettings {
        WriterSettings {
            batch_size,
            flush_interval,
            retry: RetryPolicy::new(2, Duration::from_millis(1)),
            emergency_log: dir.join("emergency.log"),
        }
    }

    fn started(function: &str) -> Event {
        Event::new(
            EventType::FunctionStarted,
            "s1",
            new_invocation_id(),
            function,
            EventPayload::Started { parameters: None },
        )
    }

    #[tokio::test]
    async fn test_async_writer_entries() {
        let dir = tempfile::tempdir().unwrap();
        let db = create_test_db().await;
        let bus = EventBus::spawn();
        let writer = AsyncWriter::spawn(db.clone(), &bus, None, settings(dir.path(), 10, Duration::from_millis(50)));

        for _ in 0..5 {
            writer.write_entry(LogEntry::from_event(&started("fetch")).unwrap());
        }

        // Wait for flush
        tokio::time::sleep(Duration::from_millis(200)).await;

        let logs = db.query_logs(&LogFilter::default()).await.unwrap();
        assert_eq!(logs.len(), 5);
        assert_eq!(writer.stats().entries_written, 5);
    }

    #[tokio::test]
    async fn test_batch_flush() {
        let dir = tempfile::tempdir().unwrap();
        let db = create_test_db().await;
        let bus = EventBus::spawn();
        let batch_size = 3;
        let writer = AsyncWriter::spawn(db.clone(), &bus, None, settings(dir.path(), batch_size, Duration::from_secs(10)));

        // Exactly batch_size entries trigger an immediate flush
        for _ in 0..batch_size {
            writer.write_entry(LogEntry::from_event(&started("score")).unwrap());
        }

        tokio::time::sleep(Duration::from_millis(100)).await;

        let logs = db.query_logs(&LogFilter::default()).await.unwrap();
        assert_eq!(logs.len(), batch_size);
    }

    #[tokio::test]
    async fn test_attached_writer_persists_bus_events() {
        let dir = tempfile::tempdir().unwrap();
        let db = create_test_db().await;
        let bus = EventBus::spawn();
        let writer = AsyncWriter::spawn(db.clone(), &bus, None, settings(dir.path(), 100, Duration::from_secs(10)));
        writer.attach(&bus);

        bus.publish(started("fetch"));
        bus.publish(Event::new(
            EventType::ProgressUpdated,
            "s1",
            new_invocation_id(),
            "fetch",
            EventPayload::ProgressUpdated { step: "fetch".to_string(), percent: 10.0 },
        ));

        bus.flush().await;
        writer.flush().await;

        let logs = db.query_logs(&LogFilter::default()).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].event_type, EventType::FunctionStarted);
    }

    #[tokio::test]
    async fn test_failed_batch_goes_to_emergency_log() {
        let dir = tempfile::tempdir().unwrap();
        let db = create_test_db().await;
        let bus = EventBus::spawn();

        let failures = Arc::new(AtomicU64::new(0));
        let seen = failures.clone();
        bus.subscribe(EventType::PersistenceFailed, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let writer = AsyncWriter::spawn(db.clone(), &bus, None, settings(dir.path(), 100, Duration::from_secs(10)));

        // Closing the pool makes every insert fail
        db.close().await;
        writer.write_entry(LogEntry::from_event(&started("fetch")).unwrap());
        writer.flush().await;
        bus.flush().await;

        let emergency = std::fs::read_to_string(dir.path().join("emergency.log")).unwrap();
        assert_eq!(emergency.lines().count(), 1);
        assert!(emergency.contains("\"table\":\"log_entries\""));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(writer.stats().failed_batches, 1);
    }
}
