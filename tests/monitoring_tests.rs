/// End-to-end tests of the monitoring core: instrumented calls flowing through
/// the bus into the store, aggregator, progress tracker and alert engine
use callwatch::aggregator::{summarize, Granularity, PerformanceMetric};
use callwatch::alerts::{AlertEngine, AlertNotification};
use callwatch::config::{ConfigManager, MonitorConfig};
use callwatch::events::{Event, EventPayload, EventType};
use callwatch::progress::{SessionPlan, SessionStatus};
use callwatch::store::{ExportFormat, LogEntry, LogFilter, MetricFilter, TimeRange};
use callwatch::{Monitor, MonitorOptions};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, thiserror::Error)]
enum AnalyzerError {
    #[error("request timed out")]
    Timeout,
}

fn test_config(dir: &TempDir) -> MonitorConfig {
    MonitorConfig {
        storage_path: dir.path().join("monitoring.db"),
        text_log_path: dir.path().join("monitoring.log"),
        ..Default::default()
    }
}

async fn start_monitor(dir: &TempDir) -> Arc<Monitor> {
    let manager = Arc::new(ConfigManager::from_config(test_config(dir)).unwrap());
    let options = MonitorOptions {
        config_poll_interval: None,
        final_sweep: false,
        ..Default::default()
    };
    Monitor::start_with(manager, options, AlertEngine::new).await.unwrap()
}

fn function_entries(entries: &[LogEntry], function: &str) -> Vec<LogEntry> {
    entries.iter().filter(|e| e.function_name == function).cloned().collect()
}

#[tokio::test]
async fn test_three_calls_produce_events_and_summary() {
    let dir = TempDir::new().unwrap();
    let monitor = start_monitor(&dir).await;

    let score = monitor
        .instrument("analyzer::score")
        .track_execution()
        .track_performance()
        .in_session("batch-1");

    score
        .call_async(async {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            Ok::<_, AnalyzerError>("scored")
        })
        .await
        .unwrap();
    score
        .call_async(async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, AnalyzerError>("scored")
        })
        .await
        .unwrap();
    let failed = score
        .call_async(async { Err::<&str, _>(AnalyzerError::Timeout) })
        .await;
    assert!(matches!(failed, Err(AnalyzerError::Timeout)));

    monitor.flush().await;

    let entries = function_entries(
        &monitor.query_logs(&LogFilter::default()).await.unwrap(),
        "analyzer::score",
    );
    let count = |t: EventType| entries.iter().filter(|e| e.event_type == t).count();
    assert_eq!(count(EventType::FunctionStarted), 3);
    assert_eq!(count(EventType::FunctionCompleted), 2);
    assert_eq!(count(EventType::FunctionFailed), 1);

    let failure = entries
        .iter()
        .find(|e| e.event_type == EventType::FunctionFailed)
        .unwrap();
    assert_eq!(failure.error_kind.as_deref(), Some("AnalyzerError"));
    assert_eq!(failure.error_message.as_deref(), Some("request timed out"));

    let summaries = monitor
        .get_performance_summary(&TimeRange::last(ChronoDuration::hours(1)), Granularity::Day)
        .await
        .unwrap();
    let total: u64 = summaries
        .iter()
        .filter(|s| s.function_name == "analyzer::score")
        .map(|s| s.count)
        .sum();
    let successes: u64 = summaries
        .iter()
        .filter(|s| s.function_name == "analyzer::score")
        .map(|s| s.success_count)
        .sum();
    assert_eq!(total, 3);
    assert_eq!(format!("{:.3}", successes as f64 / total as f64), "0.667");

    let slowest = summaries.iter().map(|s| s.max_ms).fold(0.0, f64::max);
    assert!(slowest >= 1200.0);

    monitor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_each_call_has_one_started_and_one_terminal_event() {
    let dir = TempDir::new().unwrap();
    let monitor = start_monitor(&dir).await;

    let parse = monitor
        .instrument("analyzer::parse")
        .track_execution()
        .in_session("batch-2")
        .wrap(|raw: &str| raw.parse::<i64>());

    assert_eq!(parse("12"), Ok(12));
    assert!(parse("twelve").is_err());
    assert_eq!(parse("-4"), Ok(-4));

    monitor.flush().await;

    let entries = monitor
        .query_logs(&LogFilter {
            session_id: Some("batch-2".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(entries.len(), 6);

    let mut by_invocation: BTreeMap<String, Vec<LogEntry>> = BTreeMap::new();
    for entry in entries {
        by_invocation.entry(entry.invocation_id.clone()).or_default().push(entry);
    }
    assert_eq!(by_invocation.len(), 3);

    for events in by_invocation.values() {
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::FunctionStarted);
        assert!(events[1].event_type.is_terminal());
        assert_eq!(events[0].session_id, events[1].session_id);
    }

    monitor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stored_summaries_match_recomputation() {
    let dir = TempDir::new().unwrap();
    let monitor = start_monitor(&dir).await;

    // Mid-morning three days ago, so every metric lands in the same day bucket
    let day_start = callwatch::aggregator::bucket_bounds(Utc::now() - ChronoDuration::days(3), Granularity::Day).0;
    let base = day_start + ChronoDuration::hours(10);
    let metrics: Vec<PerformanceMetric> = [120.0, 80.5, 300.25, 95.0, 410.0]
        .iter()
        .enumerate()
        .map(|(i, ms)| PerformanceMetric {
            timestamp: base + ChronoDuration::minutes(i as i64),
            session_id: "batch-3".to_string(),
            function_name: "analyzer::fetch_posts".to_string(),
            execution_time_ms: *ms,
            memory_peak_bytes: 1_000_000 + i as u64,
            cpu_percent: 12.5,
            api_calls: 2,
            db_ops: 1,
            success: i != 2,
        })
        .collect();
    monitor.db().insert_metrics(&metrics).await.unwrap();

    let range = TimeRange::new(base - ChronoDuration::days(1), base + ChronoDuration::days(1));
    let live = monitor.get_performance_summary(&range, Granularity::Day).await.unwrap();

    let written = monitor
        .aggregator()
        .recompute_summaries(&range, Granularity::Day)
        .await
        .unwrap();
    assert!(written >= 1);
    let stored = monitor.get_performance_summary(&range, Granularity::Day).await.unwrap();

    assert_eq!(live, stored);
    assert_eq!(stored.len(), 1);

    let end = day_start + ChronoDuration::days(1);
    let direct = summarize("analyzer::fetch_posts", Granularity::Day, day_start, end, &metrics).unwrap();
    assert_eq!(stored[0], direct);

    monitor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_export_import_reconstructs_query_result() {
    let dir = TempDir::new().unwrap();
    let monitor = start_monitor(&dir).await;

    let fetch = monitor
        .instrument("analyzer::fetch_trending")
        .track_execution()
        .with_params(&serde_json::json!({ "subreddit": "rust", "limit": 25 }));
    fetch.call(|| Ok::<_, AnalyzerError>(vec![1, 2, 3])).unwrap();
    let _ = fetch.call(|| Err::<Vec<i32>, _>(AnalyzerError::Timeout));
    monitor.flush().await;

    let range = TimeRange::last(ChronoDuration::hours(1));
    let expected: Vec<LogEntry> = monitor
        .query_logs(&LogFilter {
            time_range: Some(range),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_iter()
        .map(|mut e| {
            e.id = None;
            e
        })
        .collect();
    assert!(expected.len() >= 4);

    for format in [ExportFormat::Json, ExportFormat::Csv] {
        let bytes = monitor.export_data(format, range).await.unwrap();
        let imported = monitor.import_data(format, &bytes).unwrap();
        assert_eq!(imported, expected, "format {:?}", format);
    }

    monitor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retention_keeps_summaries_of_deleted_metrics() {
    let dir = TempDir::new().unwrap();
    let monitor = start_monitor(&dir).await;
    let now = Utc::now();

    let old_event = |days: i64| {
        let event = Event::new(
            EventType::FunctionStarted,
            "batch-4",
            callwatch::events::new_invocation_id(),
            "analyzer::score",
            EventPayload::Started { parameters: None },
        )
        .at(now - ChronoDuration::days(days));
        LogEntry::from_event(&event).unwrap()
    };
    monitor
        .db()
        .insert_log_entries(&[old_event(91), old_event(89)])
        .await
        .unwrap();

    let old_metric = PerformanceMetric {
        timestamp: chrono::DateTime::from_timestamp_millis((now - ChronoDuration::days(100)).timestamp_millis()).unwrap(),
        session_id: "batch-4".to_string(),
        function_name: "analyzer::score".to_string(),
        execution_time_ms: 250.0,
        memory_peak_bytes: 0,
        cpu_percent: 0.0,
        api_calls: 0,
        db_ops: 0,
        success: true,
    };
    monitor.db().insert_metrics(&[old_metric.clone()]).await.unwrap();

    let stats = monitor.cleanup_now().await.unwrap();
    assert_eq!(stats.log_entries_deleted, 1);
    assert_eq!(stats.metrics_deleted, 1);
    assert!(stats.summaries_materialized >= 1);

    let remaining = monitor
        .query_logs(&LogFilter {
            session_id: Some("batch-4".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);

    let metrics = monitor.db().query_metrics(&MetricFilter::default()).await.unwrap();
    assert!(metrics.is_empty());

    let range = TimeRange::new(now - ChronoDuration::days(101), now);
    let summaries = monitor
        .db()
        .query_summaries(Some("analyzer::score"), Granularity::Day, &range)
        .await
        .unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].count, 1);
    assert_eq!(summaries[0].mean_ms, 250.0);

    // A second sweep finds nothing left to do
    let again = monitor.cleanup_now().await.unwrap();
    assert_eq!(again.log_entries_deleted + again.metrics_deleted + again.summaries_deleted, 0);

    monitor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fetch_failure_notifies_file_channel_promptly() {
    let dir = TempDir::new().unwrap();
    let monitor = start_monitor(&dir).await;

    let fetch = monitor
        .instrument("analyzer::fetch_trending")
        .track_execution();
    let _ = fetch.call(|| Err::<(), _>(AnalyzerError::Timeout));

    monitor.flush().await;
    monitor.alerts().wait_for_deliveries().await;

    let failure = monitor
        .query_logs(&LogFilter {
            event_type: Some(EventType::FunctionFailed),
            ..Default::default()
        })
        .await
        .unwrap()
        .remove(0);

    let alert_log = std::fs::read_to_string(monitor.config().alert_log_path()).unwrap();
    let delivered: Vec<AlertNotification> = alert_log
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    let fetch_alert = delivered
        .iter()
        .find(|a| a.rule_name == "fetch_failure")
        .expect("fetch_failure delivered to the file channel");
    assert!(fetch_alert.triggered_at - failure.timestamp < ChronoDuration::minutes(2));
    assert_eq!(fetch_alert.function_name.as_deref(), Some("analyzer::fetch_trending"));

    // One failed call out of one breaches the error-rate rule in the same pass
    assert!(delivered.iter().any(|a| a.rule_name == "high_error_rate"));

    let mut keys: Vec<&str> = delivered.iter().map(|a| a.dedup_key.as_str()).collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), delivered.len());

    monitor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rejected_reload_keeps_previous_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("monitoring.json");

    let manager = ConfigManager::load(&path).unwrap();
    assert!(path.exists());
    assert_eq!(manager.current().log_retention_days, 90);

    let mut doc: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    doc["logRetentionDays"] = serde_json::json!(-5);
    std::fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();

    let err = manager.reload().unwrap_err();
    assert_eq!(err.kind(), "config_validation");
    assert_eq!(manager.current().log_retention_days, 90);

    doc["logRetentionDays"] = serde_json::json!(120);
    doc["summaryRetentionDays"] = serde_json::json!(400);
    std::fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();

    let active = manager.reload().unwrap();
    assert_eq!(active.log_retention_days, 120);
    assert_eq!(manager.current().summary_retention_days, 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_steps_reach_exactly_one_hundred() {
    let dir = TempDir::new().unwrap();
    let monitor = start_monitor(&dir).await;

    let percents = Arc::new(Mutex::new(Vec::new()));
    let seen = percents.clone();
    monitor.bus().subscribe(EventType::ProgressUpdated, move |event| {
        if event.session_id == "batch-7" {
            if let EventPayload::ProgressUpdated { percent, .. } = &event.payload {
                seen.lock().unwrap().push(*percent);
            }
        }
    });

    monitor.start_session("batch-7", SessionPlan::steps(100)).unwrap();
    let step = monitor.instrument("analyzer::score_post").progress_step("batch-7", 1.0);

    let mut handles = Vec::new();
    for i in 0..100u32 {
        let step = step.clone();
        handles.push(tokio::spawn(async move {
            step.call_async(async move { Ok::<_, AnalyzerError>(i) }).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    monitor.flush().await;

    let state = monitor.get_current_progress("batch-7").unwrap();
    assert_eq!(state.status, SessionStatus::Completed);
    assert_eq!(state.percent, 100.0);
    assert_eq!(state.steps_completed, state.total_steps);
    assert_eq!(state.steps_completed, 100);

    let percents = percents.lock().unwrap().clone();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.iter().filter(|p| **p == 100.0).count(), 1);
    assert_eq!(percents.last(), Some(&100.0));

    monitor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_step_counts_and_abort_keeps_entries() {
    let dir = TempDir::new().unwrap();
    let monitor = start_monitor(&dir).await;

    monitor.start_session("batch-8", SessionPlan::steps(4)).unwrap();
    let step = monitor.monitor_all("analyzer::fetch_comments", "batch-8", 1.0);

    step.call(|| Ok::<_, AnalyzerError>(())).unwrap();
    let _ = step.call(|| Err::<(), _>(AnalyzerError::Timeout));
    step.call(|| Ok::<_, AnalyzerError>(())).unwrap();
    monitor.flush().await;

    // A failed step is counted; the batch carries on
    let state = monitor.get_current_progress("batch-8").unwrap();
    assert_eq!(state.status, SessionStatus::Running);
    assert_eq!(state.error_count, 1);
    assert_eq!(state.steps_completed, 2);
    assert_eq!(state.percent, 50.0);

    let state = monitor.abort_session("batch-8").unwrap();
    assert_eq!(state.status, SessionStatus::FailedTerminal);
    assert!(monitor.status().await.unwrap().active_sessions.is_empty());
    monitor.flush().await;

    let entries = monitor
        .query_logs(&LogFilter {
            session_id: Some("batch-8".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(entries.iter().any(|e| e.event_type == EventType::StepFailed));
    assert_eq!(
        entries.iter().filter(|e| e.event_type == EventType::FunctionStarted).count(),
        3
    );

    monitor.shutdown().await.unwrap();
}
