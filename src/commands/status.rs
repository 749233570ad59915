use super::{format_number, open_store};
use anyhow::Result;
use callwatch::events::EventType;
use callwatch::store::{LogFilter, TimeRange};
use colored::Colorize;
use std::path::Path;

/// Show store statistics and the last hour of activity
pub async fn execute(config_path: &Path) -> Result<()> {
    let (cfg, db) = open_store(config_path).await?;
    let stats = db.get_stats().await?;

    println!("{}", "Monitoring Store Statistics".bold().underline());
    println!();
    println!("{:<30} {}", "Database:", cfg.storage_path.display());
    println!("{:<30} {:>15}", "Log Entries:", format_number(stats.log_entry_count));
    println!("{:<30} {:>15}", "Performance Metrics:", format_number(stats.metric_count));
    println!("{:<30} {:>15}", "Stored Summaries:", format_number(stats.summary_count));
    println!(
        "{:<30} {:>15}",
        "Size:",
        format!("{:.1} MiB", stats.database_size_bytes as f64 / (1024.0 * 1024.0))
    );
    println!();

    let last_hour = TimeRange::last(chrono::Duration::hours(1));
    let count = |event_type: EventType| {
        let filter = LogFilter {
            event_type: Some(event_type),
            time_range: Some(last_hour),
            ..Default::default()
        };
        let db = &db;
        async move { db.count_logs(&filter).await }
    };

    let completed = count(EventType::FunctionCompleted).await?;
    let failed = count(EventType::FunctionFailed).await?;

    println!("{}", "Recent Activity (Last Hour)".bold());
    println!("{:<30} {:>15}", "  Completed Calls:", format_number(completed));
    let failed_text = format_number(failed);
    println!(
        "{:<30} {:>15}",
        "  Failed Calls:",
        if failed > 0 { failed_text.red().to_string() } else { failed_text }
    );
    println!();

    let emergency = cfg.emergency_log_path();
    if emergency.exists() {
        println!(
            "{} {}",
            "Emergency log present:".yellow().bold(),
            emergency.display()
        );
    }

    Ok(())
}
