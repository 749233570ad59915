//! Command implementations for the CLI
//!
//! - config: configuration display and validation
//! - logs: query stored entries
//! - export: dump entries as JSON lines or CSV
//! - summary: per-function performance summaries and trends
//! - cleanup: run the retention sweep
//! - status: store statistics

pub mod cleanup;
pub mod config;
pub mod export;
pub mod logs;
pub mod status;
pub mod summary;

use anyhow::{Context, Result};
use callwatch::config::{load_config, MonitorConfig};
use callwatch::store::MonitorDb;
use std::path::Path;

/// Load the configuration and open the store it points at
pub async fn open_store(config_path: &Path) -> Result<(MonitorConfig, MonitorDb)> {
    let cfg = load_config(config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;
    let db = MonitorDb::new(&cfg.database_url())
        .await
        .with_context(|| format!("opening store at {}", cfg.storage_path.display()))?;
    Ok((cfg, db))
}

/// Format large numbers with commas
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();

    for (count, ch) in s.chars().rev().enumerate() {
        if count > 0 && count % 3 == 0 {
            result.push(',');
        }
        result.push(ch);
    }

    result.chars().rev().collect()
}

/// Colour a duration by how slow it is
pub fn format_duration(ms: f64) -> String {
    use colored::Colorize;

    if ms < 1000.0 {
        format!("{:.1}ms", ms).green().to_string()
    } else if ms < 10000.0 {
        format!("{:.2}s", ms / 1000.0).cyan().to_string()
    } else {
        format!("{:.2}s", ms / 1000.0).yellow().to_string()
    }
}
