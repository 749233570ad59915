//! Logs query command
//!
//! Query and display stored log entries.

use super::{format_duration, open_store};
use anyhow::Result;
use callwatch::events::EventType;
use callwatch::store::{LogEntry, LogFilter, MonitorDb, TimeRange};
use chrono::Utc;
use clap::Parser;
use colored::Colorize;
use std::path::Path;

/// Query and display log entries
#[derive(Debug, Clone, Parser)]
pub struct LogsArgs {
    /// Filter by exact function name
    #[arg(long)]
    pub function: Option<String>,

    /// Filter by event type (e.g. function.failed)
    #[arg(short = 't', long)]
    pub event_type: Option<EventType>,

    /// Filter by session ID
    #[arg(short, long)]
    pub session: Option<String>,

    /// Show entries since N seconds ago (e.g., 3600 for last hour)
    #[arg(long)]
    pub since: Option<u64>,

    /// Maximum number of results
    #[arg(long, default_value = "100")]
    pub limit: usize,

    /// Output format (text, json)
    #[arg(short = 'f', long, default_value = "text")]
    pub format: String,

    /// Follow new entries (tail -f mode)
    #[arg(long)]
    pub follow: bool,
}

impl LogsArgs {
    fn filter(&self) -> LogFilter {
        LogFilter {
            function_name: self.function.clone(),
            event_type: self.event_type,
            session_id: self.session.clone(),
            time_range: self
                .since
                .map(|s| TimeRange::last(chrono::Duration::seconds(s as i64))),
            limit: Some(self.limit),
            offset: None,
        }
    }
}

/// Execute the logs command
pub async fn execute(config_path: &Path, args: LogsArgs) -> Result<()> {
    let (_, db) = open_store(config_path).await?;
    let filter = args.filter();

    if args.follow {
        return follow_logs(&db, filter).await;
    }

    let logs = db.query_logs(&filter).await?;
    if logs.is_empty() {
        println!("{}", "No log entries found matching the criteria".yellow());
        return Ok(());
    }

    match args.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&logs)?),
        _ => {
            println!("{}", format!("Found {} log entries", logs.len()).bold());
            println!();
            display_logs_text(&logs);
        }
    }

    Ok(())
}

fn display_logs_text(logs: &[LogEntry]) {
    for log in logs {
        let timestamp = log.timestamp.format("%Y-%m-%d %H:%M:%S%.3f");

        let event_type = log.event_type.as_str();
        let event_colored = match log.event_type {
            EventType::FunctionFailed | EventType::StepFailed | EventType::PersistenceFailed => {
                event_type.red().bold()
            }
            EventType::FunctionCompleted => event_type.green(),
            EventType::FunctionStarted => event_type.blue(),
            _ => event_type.normal(),
        };

        let duration = log
            .duration_ms
            .map(|ms| format!(" {}", format_duration(ms)))
            .unwrap_or_default();

        println!(
            "{} {} {}{} {}",
            timestamp.to_string().dimmed(),
            event_colored,
            log.function_name.cyan(),
            duration,
            format!("session={}", log.session_id).dimmed(),
        );

        if let Some(message) = &log.error_message {
            let kind = log.error_kind.as_deref().unwrap_or("error");
            println!("  {} {}", format!("{}:", kind).red(), message);
        }
        if let Some(summary) = &log.result_summary {
            println!("  {}", format!("result: {}", summary).dimmed());
        }
    }
}

/// Poll for new entries and print them as they arrive
async fn follow_logs(db: &MonitorDb, mut filter: LogFilter) -> Result<()> {
    use tokio::time::{interval, Duration};

    println!("{}", "Following logs (Ctrl+C to stop)...".bold());
    println!();

    let mut since = Utc::now();
    let mut last_id: Option<i64> = None;
    let mut poll_interval = interval(Duration::from_millis(500));

    loop {
        poll_interval.tick().await;

        filter.time_range = Some(TimeRange::new(since, Utc::now()));
        filter.limit = None;

        // The range is inclusive, so entries at `since` may be seen twice
        let logs: Vec<LogEntry> = db
            .query_logs(&filter)
            .await?
            .into_iter()
            .filter(|log| last_id.map_or(true, |last| log.id.unwrap_or_default() > last))
            .collect();

        if let Some(last) = logs.last() {
            since = last.timestamp;
            last_id = last.id;
            display_logs_text(&logs);
        }
    }
}
