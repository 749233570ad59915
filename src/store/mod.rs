//! Log/metric store
//!
//! Durable persistence for the monitoring core:
//! - **Entries**: one `LogEntry` per function event, indexed by time, function, session and type
//! - **Metrics**: raw `PerformanceMetric` rows plus materialised summaries
//! - **Mirror**: a daily-rolled text log for humans, same retention
//!
//! ```text
//! EventBus ──► AsyncWriter (batch + retry) ──► MonitorDb (SQLite, WAL)
//!                    │                              │
//!                    └─► TextLogMirror              └─► query / export / cleanup
//! ```

pub mod cleanup;
pub mod database;
pub mod export;
pub mod query;
pub mod text_log;
pub mod writer;

pub use cleanup::{run_cleanup_now, spawn_cleanup_task, CleanupConfig, RetentionPolicy};
pub use database::{CleanupStats, DatabaseStats, MonitorDb};
pub use export::{export_entries, import_entries, ExportFormat};
pub use query::{LogFilter, MetricFilter, TimeRange};
pub use text_log::TextLogMirror;
pub use writer::{AsyncWriter, WriterSettings, WriterStatsSnapshot};

use crate::events::{Event, EventPayload, EventType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Durable record of one event of an instrumented invocation
///
/// Timestamps are held at millisecond precision, the precision of the store,
/// so an entry read back compares equal to the one written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Row id, assigned by the store
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub invocation_id: String,
    pub function_name: String,
    pub event_type: EventType,
    pub duration_ms: Option<f64>,
    pub parameters: Option<serde_json::Value>,
    pub result_summary: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
    pub memory_peak_bytes: Option<u64>,
    pub cpu_percent: Option<f64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl LogEntry {
    /// Build the durable record for an event
    ///
    /// Returns `None` for events that are not logged as entries (performance
    /// events go to the metrics table, progress updates are transient).
    pub fn from_event(event: &Event) -> Option<Self> {
        let mut entry = Self {
            id: None,
            timestamp: truncate_to_millis(event.timestamp),
            session_id: event.session_id.clone(),
            invocation_id: event.invocation_id.clone(),
            function_name: event.function_name.clone(),
            event_type: event.event_type,
            duration_ms: None,
            parameters: None,
            result_summary: None,
            error_kind: None,
            error_message: None,
            error_stack: None,
            memory_peak_bytes: None,
            cpu_percent: None,
            metadata: BTreeMap::new(),
        };

        match (&event.event_type, &event.payload) {
            (EventType::FunctionStarted, EventPayload::Started { parameters }) => {
                entry.parameters = parameters.clone().filter(|p| !p.is_null());
            }
            (
                EventType::FunctionCompleted,
                EventPayload::Completed { duration_ms, result_summary, resources },
            ) => {
                entry.duration_ms = Some(*duration_ms);
                entry.result_summary = non_empty(result_summary);
                if let Some(res) = resources {
                    entry.memory_peak_bytes = Some(res.memory_peak_bytes);
                    entry.cpu_percent = Some(res.cpu_percent);
                }
            }
            (
                EventType::FunctionFailed,
                EventPayload::Failed { duration_ms, error_kind, message, stack, resources },
            ) => {
                entry.duration_ms = Some(*duration_ms);
                entry.error_kind = non_empty(error_kind);
                entry.error_message = non_empty(message);
                entry.error_stack = stack.as_deref().and_then(non_empty);
                if let Some(res) = resources {
                    entry.memory_peak_bytes = Some(res.memory_peak_bytes);
                    entry.cpu_percent = Some(res.cpu_percent);
                }
            }
            (EventType::StepFailed, EventPayload::StepFailed { step, weight, message }) => {
                entry.error_kind = Some("step_failed".to_string());
                entry.error_message = non_empty(message);
                entry.metadata.insert("step".to_string(), step.clone().into());
                entry.metadata.insert("weight".to_string(), (*weight).into());
            }
            (
                EventType::SystemStartup | EventType::SystemShutdown | EventType::ConfigReloaded,
                EventPayload::System { detail },
            ) => {
                if let serde_json::Value::Object(map) = detail {
                    entry.metadata.extend(map.clone());
                }
            }
            _ => return None,
        }

        Some(entry)
    }

    /// One-line rendering used by the text mirror log
    pub fn to_text_line(&self) -> String {
        let mut line = format!(
            "{} [{}] session={} fn={} invocation={}",
            self.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            self.event_type,
            self.session_id,
            self.function_name,
            self.invocation_id,
        );
        if let Some(d) = self.duration_ms {
            line.push_str(&format!(" duration_ms={:.3}", d));
        }
        if let Some(summary) = &self.result_summary {
            line.push_str(&format!(" result={:?}", summary));
        }
        if let Some(kind) = &self.error_kind {
            line.push_str(&format!(" error_kind={}", kind));
        }
        if let Some(msg) = &self.error_message {
            line.push_str(&format!(" error={:?}", msg));
        }
        line
    }
}

pub(crate) fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
