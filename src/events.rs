//! Event model shared by the bus, the wrappers and every consumer
//!
//! Events are immutable once published; the bus hands them out as `Arc<Event>`.

use crate::aggregator::PerformanceMetric;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Session id used by calls that are not part of a progress-tracked session
pub const NO_SESSION: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "function.started")]
    FunctionStarted,
    #[serde(rename = "function.completed")]
    FunctionCompleted,
    #[serde(rename = "function.failed")]
    FunctionFailed,
    #[serde(rename = "performance.recorded")]
    PerformanceRecorded,
    #[serde(rename = "progress.step_started")]
    StepStarted,
    #[serde(rename = "progress.step_completed")]
    StepCompleted,
    #[serde(rename = "progress.step_failed")]
    StepFailed,
    #[serde(rename = "progress.updated")]
    ProgressUpdated,
    #[serde(rename = "system.startup")]
    SystemStartup,
    #[serde(rename = "system.shutdown")]
    SystemShutdown,
    #[serde(rename = "system.persistence_failed")]
    PersistenceFailed,
    #[serde(rename = "config.reloaded")]
    ConfigReloaded,
}

impl EventType {
    pub const ALL: [EventType; 12] = [
        EventType::FunctionStarted,
        EventType::FunctionCompleted,
        EventType::FunctionFailed,
        EventType::PerformanceRecorded,
        EventType::StepStarted,
        EventType::StepCompleted,
        EventType::StepFailed,
        EventType::ProgressUpdated,
        EventType::SystemStartup,
        EventType::SystemShutdown,
        EventType::PersistenceFailed,
        EventType::ConfigReloaded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FunctionStarted => "function.started",
            Self::FunctionCompleted => "function.completed",
            Self::FunctionFailed => "function.failed",
            Self::PerformanceRecorded => "performance.recorded",
            Self::StepStarted => "progress.step_started",
            Self::StepCompleted => "progress.step_completed",
            Self::StepFailed => "progress.step_failed",
            Self::ProgressUpdated => "progress.updated",
            Self::SystemStartup => "system.startup",
            Self::SystemShutdown => "system.shutdown",
            Self::PersistenceFailed => "system.persistence_failed",
            Self::ConfigReloaded => "config.reloaded",
        }
    }

    /// Terminal outcome of one instrumented invocation
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::FunctionCompleted | Self::FunctionFailed)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown event type: {}", s))
    }
}

/// Process resources sampled around one call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_peak_bytes: u64,
    pub cpu_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Started {
        /// Bounded JSON snapshot of the call parameters
        parameters: Option<serde_json::Value>,
    },
    Completed {
        duration_ms: f64,
        result_summary: String,
        resources: Option<ResourceUsage>,
    },
    Failed {
        duration_ms: f64,
        error_kind: String,
        message: String,
        stack: Option<String>,
        resources: Option<ResourceUsage>,
    },
    Performance(PerformanceMetric),
    Step {
        step: String,
        weight: f64,
    },
    StepFailed {
        step: String,
        weight: f64,
        message: String,
    },
    ProgressUpdated {
        step: String,
        percent: f64,
    },
    System {
        detail: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    /// Links the started event of a call with its terminal event
    pub invocation_id: String,
    pub function_name: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(
        event_type: EventType,
        session_id: impl Into<String>,
        invocation_id: impl Into<String>,
        function_name: impl Into<String>,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            session_id: session_id.into(),
            invocation_id: invocation_id.into(),
            function_name: function_name.into(),
            payload,
        }
    }

    /// Core-level event (startup, shutdown, persistence failures)
    pub fn system(event_type: EventType, detail: serde_json::Value) -> Self {
        Self::new(
            event_type,
            NO_SESSION,
            Uuid::new_v4().to_string(),
            "callwatch",
            EventPayload::System { detail },
        )
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Call duration carried by terminal events
    pub fn duration_ms(&self) -> Option<f64> {
        match &self.payload {
            EventPayload::Completed { duration_ms, .. } | EventPayload::Failed { duration_ms, .. } => {
                Some(*duration_ms)
            }
            EventPayload::Performance(metric) => Some(metric.execution_time_ms),
            _ => None,
        }
    }
}

pub fn new_invocation_id() -> String {
    Uuid::new_v4().to_string()
}

const ELLIPSIS: &str = "...";

/// Truncate `text` to at most `max_bytes` (marker included), respecting char boundaries
pub fn bounded(text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let (budget, marker) = if max_bytes > ELLIPSIS.len() {
        (max_bytes - ELLIPSIS.len(), ELLIPSIS)
    } else {
        (max_bytes, "")
    };
    let mut end = budget;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &text[..end], marker)
}

pub fn current_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_round_trips_through_str() {
        for t in EventType::ALL {
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
        }
        assert!("function.exploded".parse::<EventType>().is_err());
    }

    #[test]
    fn test_event_type_serde_uses_dotted_names() {
        let json = serde_json::to_string(&EventType::StepCompleted).unwrap();
        assert_eq!(json, "\"progress.step_completed\"");
    }

    #[test]
    fn test_bounded_respects_char_boundaries() {
        assert_eq!(bounded("short".to_string(), 10), "short");
        assert_eq!(bounded("abcdef".to_string(), 6), "abcdef");
        assert_eq!(bounded("abcdefg".to_string(), 6), "abc...");
        // 'é' is two bytes; cutting at 2 would split it
        assert_eq!(bounded("aé-tail".to_string(), 5), "a...");
        // No room for the marker
        assert_eq!(bounded("abcdef".to_string(), 3), "abc");
    }

    #[test]
    fn test_bounded_never_exceeds_limit() {
        let text = "défilé-".repeat(50);
        for max in 0..40 {
            assert!(bounded(text.clone(), max).len() <= max, "limit {}", max);
        }
    }
}
