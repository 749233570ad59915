use super::open_store;
use anyhow::Result;
use callwatch::store::{export_entries, ExportFormat, LogFilter, TimeRange};
use chrono::{DateTime, Utc};
use clap::Parser;
use colored::Colorize;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Export log entries
#[derive(Debug, Clone, Parser)]
pub struct ExportArgs {
    /// Output format (json, csv)
    #[arg(short = 'f', long, default_value = "json")]
    pub format: ExportFormat,

    /// Start of the range (RFC 3339); defaults to `--days` ago
    #[arg(long)]
    pub from: Option<DateTime<Utc>>,

    /// End of the range (RFC 3339); defaults to now
    #[arg(long)]
    pub to: Option<DateTime<Utc>>,

    /// Range length in days when `--from` is not given
    #[arg(long, default_value = "7")]
    pub days: i64,

    /// Write to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl ExportArgs {
    fn range(&self, now: DateTime<Utc>) -> TimeRange {
        let end = self.to.unwrap_or(now);
        let start = self.from.unwrap_or(end - chrono::Duration::days(self.days));
        TimeRange::new(start, end)
    }
}

pub async fn execute(config_path: &Path, args: ExportArgs) -> Result<()> {
    let (_, db) = open_store(config_path).await?;
    let range = args.range(Utc::now());

    let entries = db
        .query_logs(&LogFilter {
            time_range: Some(range),
            ..Default::default()
        })
        .await?;

    match &args.output {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            let mut out = std::io::BufWriter::new(file);
            let written = export_entries(&entries, args.format, &mut out)?;
            out.flush()?;
            eprintln!(
                "{}",
                format!("Exported {} entries to {}", written, path.display()).green()
            );
        }
        None => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            export_entries(&entries, args.format, &mut out)?;
            out.flush()?;
        }
    }

    Ok(())
}
