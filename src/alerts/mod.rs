//! Alert engine
//!
//! Every bus event is appended to a sliding window. The rules of the current
//! configuration snapshot are evaluated against that window in one pass, and a
//! rule that holds outside its cooldown fires a notification to each of its
//! channels. Time in this module is event time: windows and cooldowns are
//! measured against event timestamps, not the wall clock.

mod channels;
mod rules;

pub use channels::{build_channel, ConsoleChannel, FileChannel, NotificationChannel, WebhookChannel};
pub use rules::{AlertCondition, AlertRule, ChannelKind, Comparison, Severity};

use crate::aggregator::{relative_slope, BASELINE_WINDOW};
use crate::bus::{EventBus, SubscriptionId};
use crate::config::{ConfigManager, MonitorConfig};
use crate::events::{Event, EventType, NO_SESSION};
use crate::retry::{retry_with_backoff, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// Samples a function needs before its latency ratio is meaningful
pub const MIN_BASELINE_SAMPLES: usize = 5;

const HISTORY_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertNotification {
    /// Unique per firing; receivers use it to drop duplicate deliveries
    pub dedup_key: String,
    pub rule_name: String,
    pub severity: Severity,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub function_name: Option<String>,
    pub session_id: Option<String>,
    /// Timestamp of the event that made the rule hold
    pub triggered_at: DateTime<Utc>,
    pub channels: Vec<ChannelKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryFailure {
    pub dedup_key: String,
    pub rule_name: String,
    pub channel: ChannelKind,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Sample {
    timestamp: DateTime<Utc>,
    event_type: EventType,
    function_name: String,
    duration_ms: Option<f64>,
}

impl Sample {
    fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }

    fn failed(&self) -> bool {
        self.event_type == EventType::FunctionFailed
    }
}

#[derive(Default)]
struct EngineState {
    window: VecDeque<Sample>,
    /// Durations preceding the current event, per function
    baselines: HashMap<String, VecDeque<f64>>,
    /// Event time of the last firing, per rule
    last_fired: HashMap<String, DateTime<Utc>>,
}

pub struct AlertEngine {
    config: Arc<ConfigManager>,
    state: Mutex<EngineState>,
    history: Mutex<VecDeque<AlertNotification>>,
    failures: Arc<Mutex<Vec<DeliveryFailure>>>,
    channel_overrides: HashMap<ChannelKind, Arc<dyn NotificationChannel>>,
    retry: RetryPolicy,
    deliveries: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AlertEngine {
    pub fn new(config: Arc<ConfigManager>) -> Self {
        Self {
            config,
            state: Mutex::new(EngineState::default()),
            history: Mutex::new(VecDeque::new()),
            failures: Arc::new(Mutex::new(Vec::new())),
            channel_overrides: HashMap::new(),
            retry: RetryPolicy::new(3, Duration::from_millis(200)).with_max_delay(Duration::from_secs(5)),
            deliveries: Mutex::new(Vec::new()),
        }
    }

    /// Deliver `kind` notifications through `channel` instead of the configured one
    pub fn with_channel(mut self, kind: ChannelKind, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channel_overrides.insert(kind, channel);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> SubscriptionId {
        let engine = Arc::downgrade(self);
        bus.subscribe_all(move |event: Arc<Event>| {
            if let Some(engine) = engine.upgrade() {
                engine.evaluate(&event);
            }
        })
    }

    /// Fold `event` into the window and evaluate every enabled rule
    ///
    /// Returns the notifications fired by this event; their delivery runs in
    /// background tasks.
    pub fn evaluate(&self, event: &Event) -> Vec<AlertNotification> {
        // One snapshot per pass, never a mix of old and new rules
        let cfg = self.config.current();
        let now = event.timestamp;

        let sample = Sample {
            timestamp: now,
            event_type: event.event_type,
            function_name: event.function_name.clone(),
            duration_ms: if event.event_type.is_terminal() {
                event.duration_ms()
            } else {
                None
            },
        };

        let mut fired = Vec::new();
        {
            let mut state = lock(&self.state);

            let rules = cfg.alert_rules();
            state.window.push_back(sample.clone());
            let horizon = rules.iter().map(|r| r.window_minutes).max().unwrap_or(0);
            let oldest = now - chrono::Duration::minutes(horizon);
            while state.window.front().is_some_and(|s| s.timestamp < oldest) {
                state.window.pop_front();
            }

            for rule in rules.iter().filter(|r| r.enabled) {
                let Some(value) = measure(rule, &sample, &state) else {
                    continue;
                };
                if !rule.comparison.holds(value, rule.threshold) {
                    continue;
                }

                let cooling = state.last_fired.get(&rule.name).is_some_and(|last| {
                    now - *last < chrono::Duration::minutes(rule.cooldown_minutes)
                });
                if cooling {
                    tracing::debug!(rule = %rule.name, "Alert condition holds but rule is cooling down");
                    continue;
                }

                state.last_fired.insert(rule.name.clone(), now);
                fired.push(notification(rule, value, event));
            }

            if let Some(duration) = sample.duration_ms {
                let durations = state.baselines.entry(sample.function_name.clone()).or_default();
                if durations.len() == BASELINE_WINDOW {
                    durations.pop_front();
                }
                durations.push_back(duration);
            }
        }

        for alert in &fired {
            crate::metrics::record_alert_fired(&alert.rule_name);
            tracing::info!(
                rule = %alert.rule_name,
                severity = %alert.severity,
                value = alert.value,
                dedup_key = %alert.dedup_key,
                "Alert fired"
            );

            {
                let mut history = lock(&self.history);
                if history.len() == HISTORY_LIMIT {
                    history.pop_front();
                }
                history.push_back(alert.clone());
            }

            self.dispatch(alert, &cfg);
        }

        fired
    }

    fn dispatch(&self, alert: &AlertNotification, cfg: &MonitorConfig) {
        for kind in &alert.channels {
            let channel = match self.channel_overrides.get(kind) {
                Some(channel) => channel.clone(),
                None => match build_channel(*kind, cfg) {
                    Ok(channel) => channel,
                    Err(e) => {
                        record_failure(&self.failures, alert, *kind, e.to_string());
                        continue;
                    }
                },
            };

            let alert = alert.clone();
            let kind = *kind;
            let failures = self.failures.clone();
            let retry = self.retry;

            // Each channel gets its own task so a slow or failing one never holds up the rest
            let handle = tokio::spawn(async move {
                let label = format!("deliver_{}", kind.as_str());
                let result = retry_with_backoff(retry, &label, |_| channel.deliver(&alert)).await;
                if let Err(e) = result {
                    record_failure(&failures, &alert, kind, e.to_string());
                }
            });

            let mut deliveries = lock(&self.deliveries);
            deliveries.retain(|h| !h.is_finished());
            deliveries.push(handle);
        }
    }

    /// Most recent notifications, newest last
    pub fn recent_alerts(&self, limit: usize) -> Vec<AlertNotification> {
        let history = lock(&self.history);
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn delivery_failures(&self) -> Vec<DeliveryFailure> {
        lock(&self.failures).clone()
    }

    /// Wait for every delivery started so far to finish (including retries)
    pub async fn wait_for_deliveries(&self) {
        let handles: Vec<_> = lock(&self.deliveries).drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Current value of a rule's measure, or `None` when this event does not
/// bear on the rule or there is not enough data
fn measure(rule: &AlertRule, current: &Sample, state: &EngineState) -> Option<f64> {
    let since = current.timestamp - chrono::Duration::minutes(rule.window_minutes);
    let in_window = || state.window.iter().filter(move |s| s.timestamp >= since);
    let matches_function = |filter: &Option<String>, name: &str| filter.as_deref().map_or(true, |f| f == name);

    match &rule.condition {
        AlertCondition::EventCount { event_type, function_contains } => {
            let relevant = |s: &Sample| {
                s.event_type == *event_type
                    && function_contains
                        .as_deref()
                        .map_or(true, |pattern| s.function_name.contains(pattern))
            };
            if !relevant(current) {
                return None;
            }
            Some(in_window().filter(|s| relevant(s)).count() as f64)
        }
        AlertCondition::ErrorRate { function_name, min_calls } => {
            if !current.is_terminal() || !matches_function(function_name, &current.function_name) {
                return None;
            }
            let (calls, failures) = in_window()
                .filter(|s| s.is_terminal() && matches_function(function_name, &s.function_name))
                .fold((0u64, 0u64), |(calls, failures), s| (calls + 1, failures + s.failed() as u64));
            if calls == 0 || calls < *min_calls {
                return None;
            }
            Some(failures as f64 / calls as f64)
        }
        AlertCondition::LatencyAbove { function_name } => {
            if !matches_function(function_name, &current.function_name) {
                return None;
            }
            current.duration_ms
        }
        AlertCondition::LatencyRatio { function_name } => {
            if !matches_function(function_name, &current.function_name) {
                return None;
            }
            let duration = current.duration_ms?;
            let previous = state.baselines.get(&current.function_name)?;
            if previous.len() < MIN_BASELINE_SAMPLES {
                return None;
            }
            let mut sorted: Vec<f64> = previous.iter().copied().collect();
            sorted.sort_by(|a, b| a.total_cmp(b));
            let baseline = sorted.iter().sum::<f64>() / sorted.len() as f64;
            if baseline <= 0.0 {
                return None;
            }
            Some(duration / baseline)
        }
        AlertCondition::RegressionSign { function_name, min_samples } => {
            if current.duration_ms.is_none() || !matches_function(function_name, &current.function_name) {
                return None;
            }
            let durations: Vec<f64> = in_window()
                .filter(|s| s.function_name == current.function_name)
                .filter_map(|s| s.duration_ms)
                .collect();
            if durations.len() < (*min_samples).max(2) {
                return None;
            }
            relative_slope(&durations)
        }
    }
}

fn notification(rule: &AlertRule, value: f64, event: &Event) -> AlertNotification {
    AlertNotification {
        dedup_key: Uuid::new_v4().to_string(),
        rule_name: rule.name.clone(),
        severity: rule.severity,
        message: format!("{}: {} (value {:.3}, fn {})", rule.name, rule.describe(), value, event.function_name),
        value,
        threshold: rule.threshold,
        function_name: Some(event.function_name.clone()),
        session_id: (event.session_id != NO_SESSION).then(|| event.session_id.clone()),
        triggered_at: event.timestamp,
        channels: rule.channels.clone(),
    }
}

fn record_failure(failures: &Mutex<Vec<DeliveryFailure>>, alert: &AlertNotification, channel: ChannelKind, error: String) {
    crate::metrics::record_channel_failure(channel.as_str());
    tracing::error!(
        rule = %alert.rule_name,
        channel = channel.as_str(),
        dedup_key = %alert.dedup_key,
        error = %error,
        "Alert delivery failed"
    );

    let mut failures = lock(failures);
    if failures.len() == HISTORY_LIMIT {
        failures.remove(0);
    }
    failures.push(DeliveryFailure {
        dedup_key: alert.dedup_key.clone(),
        rule_name: alert.rule_name.clone(),
        channel,
        error,
        failed_at: Utc::now(),
    });
}
