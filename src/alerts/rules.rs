//! Declarative alert rules
//!
//! Rules are plain data carried in the configuration file, e.g.
//!
//! ```json
//! {
//!   "name": "fetch_failure",
//!   "condition": { "type": "event_count", "eventType": "function.failed", "functionContains": "fetch" },
//!   "comparison": "gte",
//!   "threshold": 1.0,
//!   "windowMinutes": 2,
//!   "cooldownMinutes": 5,
//!   "channels": ["file", "console"]
//! }
//! ```

use crate::events::EventType;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub condition: AlertCondition,
    #[serde(default)]
    pub comparison: Comparison,
    pub threshold: f64,
    pub window_minutes: i64,
    #[serde(default = "default_cooldown")]
    pub cooldown_minutes: i64,
    #[serde(default)]
    pub severity: Severity,
    pub channels: Vec<ChannelKind>,
}

fn default_enabled() -> bool {
    true
}

fn default_cooldown() -> i64 {
    5
}

/// What a rule measures over its window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AlertCondition {
    /// Number of events of `event_type` in the window, optionally only for
    /// functions whose name contains `function_contains`
    EventCount {
        event_type: EventType,
        #[serde(default)]
        function_contains: Option<String>,
    },
    /// Failed calls / terminal calls in the window
    ErrorRate {
        #[serde(default)]
        function_name: Option<String>,
        #[serde(default)]
        min_calls: u64,
    },
    /// Duration of the latest call, in milliseconds
    LatencyAbove {
        #[serde(default)]
        function_name: Option<String>,
    },
    /// Duration of the latest call divided by the function's rolling baseline
    LatencyRatio {
        #[serde(default)]
        function_name: Option<String>,
    },
    /// Relative least-squares slope of durations in the window
    RegressionSign {
        #[serde(default)]
        function_name: Option<String>,
        #[serde(default = "default_min_samples")]
        min_samples: usize,
    },
}

fn default_min_samples() -> usize {
    5
}

impl AlertCondition {
    pub fn function_filter(&self) -> Option<&str> {
        match self {
            Self::EventCount { .. } => None,
            Self::ErrorRate { function_name, .. }
            | Self::LatencyAbove { function_name }
            | Self::LatencyRatio { function_name }
            | Self::RegressionSign { function_name, .. } => function_name.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Gt,
    #[default]
    Gte,
    Lt,
    Lte,
}

impl Comparison {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Gte => value >= threshold,
            Self::Lt => value < threshold,
            Self::Lte => value <= threshold,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Console,
    File,
    Webhook,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::File => "file",
            Self::Webhook => "webhook",
        }
    }
}

impl AlertRule {
    /// Built-in rules: fetch failures, latency degradation, high error rate
    pub fn defaults(multiplier: f64, error_rate_threshold: f64, error_rate_window_minutes: i64) -> Vec<AlertRule> {
        let channels = vec![ChannelKind::File, ChannelKind::Console];

        vec![
            AlertRule {
                name: "fetch_failure".to_string(),
                enabled: true,
                condition: AlertCondition::EventCount {
                    event_type: EventType::FunctionFailed,
                    function_contains: Some("fetch".to_string()),
                },
                comparison: Comparison::Gte,
                threshold: 1.0,
                window_minutes: 2,
                cooldown_minutes: default_cooldown(),
                severity: Severity::Critical,
                channels: channels.clone(),
            },
            AlertRule {
                name: "performance_degradation".to_string(),
                enabled: true,
                condition: AlertCondition::LatencyRatio { function_name: None },
                comparison: Comparison::Gt,
                threshold: multiplier,
                window_minutes: 10,
                cooldown_minutes: default_cooldown(),
                severity: Severity::Warning,
                channels: channels.clone(),
            },
            AlertRule {
                name: "high_error_rate".to_string(),
                enabled: true,
                condition: AlertCondition::ErrorRate {
                    function_name: None,
                    min_calls: 1,
                },
                comparison: Comparison::Gt,
                threshold: error_rate_threshold,
                window_minutes: error_rate_window_minutes,
                cooldown_minutes: default_cooldown(),
                severity: Severity::Critical,
                channels,
            },
        ]
    }

    /// Human-readable description of the condition, used in notifications
    pub fn describe(&self) -> String {
        let what = match &self.condition {
            AlertCondition::EventCount { event_type, function_contains } => match function_contains {
                Some(pattern) => format!("count({} where function contains '{}')", event_type, pattern),
                None => format!("count({})", event_type),
            },
            AlertCondition::ErrorRate { .. } => "error_rate".to_string(),
            AlertCondition::LatencyAbove { .. } => "latency_ms".to_string(),
            AlertCondition::LatencyRatio { .. } => "latency / baseline".to_string(),
            AlertCondition::RegressionSign { .. } => "relative latency slope".to_string(),
        };
        format!(
            "{} {} {} within {}m",
            what,
            self.comparison.symbol(),
            self.threshold,
            self.window_minutes
        )
    }
}
