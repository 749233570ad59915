use super::{format_number, open_store};
use anyhow::Result;
use callwatch::store::{run_cleanup_now, RetentionPolicy, TextLogMirror};
use chrono::Utc;
use colored::Colorize;
use std::path::Path;

/// Run the retention sweep and show what it removed
pub async fn execute(config_path: &Path) -> Result<()> {
    let (cfg, db) = open_store(config_path).await?;
    let mirror = TextLogMirror::new(&cfg.text_log_path)?;
    let policy = RetentionPolicy::from_config(&cfg);

    println!("{}", "Running cleanup...".bold());
    println!(
        "  Keeping {} days of entries and {} days of summaries",
        policy.log_retention_days, policy.summary_retention_days
    );
    println!();

    let stats = run_cleanup_now(&db, Some(&mirror), &policy, Utc::now()).await?;

    println!("{}", "Cleanup Results:".green().bold());
    println!(
        "{:<30} {:>15}",
        "  Summaries Materialised:",
        format_number(stats.summaries_materialized)
    );
    println!("{:<30} {:>15}", "  Log Entries Deleted:", format_number(stats.log_entries_deleted));
    println!("{:<30} {:>15}", "  Metrics Deleted:", format_number(stats.metrics_deleted));
    println!("{:<30} {:>15}", "  Summaries Deleted:", format_number(stats.summaries_deleted));
    println!("{:<30} {:>15}", "  Text Log Files Deleted:", format_number(stats.text_logs_deleted));
    println!();

    let deleted = stats.log_entries_deleted + stats.metrics_deleted + stats.summaries_deleted + stats.text_logs_deleted;
    if deleted == 0 {
        println!("{}", "No old data to delete (all data within retention period)".dimmed());
    } else {
        println!("{}", "Cleanup completed successfully!".green().bold());
    }

    Ok(())
}
