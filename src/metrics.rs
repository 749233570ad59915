use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Duration;

/// Describe the core's self-metrics
///
/// Recording works without this; descriptions only matter once the embedding
/// application installs a recorder.
pub fn init_metric_descriptions() {
    describe_counter!(
        "callwatch_events_published_total",
        "Total number of events published on the bus"
    );
    describe_counter!(
        "callwatch_handler_panics_total",
        "Event handlers that panicked during delivery"
    );
    describe_counter!(
        "callwatch_instrumentation_failures_total",
        "Wrapper-internal failures that were swallowed"
    );
    describe_counter!(
        "callwatch_entries_persisted_total",
        "Log entries and metrics written to the store"
    );
    describe_counter!(
        "callwatch_persistence_failures_total",
        "Batches that exhausted their retries"
    );
    describe_histogram!(
        "callwatch_batch_flush_seconds",
        "Time spent writing one batch to the store"
    );
    describe_counter!(
        "callwatch_alerts_fired_total",
        "Alert rule firings"
    );
    describe_counter!(
        "callwatch_channel_failures_total",
        "Notification deliveries that failed after retries"
    );
}

pub fn record_event_published(event_type: &'static str) {
    counter!("callwatch_events_published_total", "event_type" => event_type).increment(1);
}

pub fn record_handler_panic(event_type: &'static str) {
    counter!("callwatch_handler_panics_total", "event_type" => event_type).increment(1);
}

pub fn record_instrumentation_failure(function: &str) {
    counter!(
        "callwatch_instrumentation_failures_total",
        "function" => function.to_string(),
    )
    .increment(1);
}

pub fn record_persisted(table: &'static str, count: u64) {
    counter!("callwatch_entries_persisted_total", "table" => table).increment(count);
}

pub fn record_persistence_failure(table: &'static str) {
    counter!("callwatch_persistence_failures_total", "table" => table).increment(1);
}

pub fn record_batch_flush(table: &'static str, elapsed: Duration) {
    histogram!("callwatch_batch_flush_seconds", "table" => table).record(elapsed.as_secs_f64());
}

pub fn record_alert_fired(rule: &str) {
    counter!("callwatch_alerts_fired_total", "rule" => rule.to_string()).increment(1);
}

pub fn record_channel_failure(channel: &'static str) {
    counter!("callwatch_channel_failures_total", "channel" => channel).increment(1);
}
