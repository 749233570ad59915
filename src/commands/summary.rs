use super::{format_duration, format_number, open_store};
use anyhow::Result;
use callwatch::aggregator::{detect_trend, Granularity, PerformanceAggregator, PerformanceSummary, TrendDirection, TrendMetric};
use callwatch::config::ConfigManager;
use callwatch::store::TimeRange;
use clap::Parser;
use colored::Colorize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Show performance summaries
#[derive(Debug, Clone, Parser)]
pub struct SummaryArgs {
    /// Bucket size (day, week, month)
    #[arg(short, long, default_value = "day")]
    pub granularity: Granularity,

    /// How many days back to cover
    #[arg(short, long, default_value = "7")]
    pub days: i64,

    /// Only this function
    #[arg(long)]
    pub function: Option<String>,

    /// Regenerate stored summaries from raw metrics first
    #[arg(long)]
    pub recompute: bool,

    /// Output format (text, json)
    #[arg(short = 'f', long, default_value = "text")]
    pub format: String,
}

pub async fn execute(config_path: &Path, args: SummaryArgs) -> Result<()> {
    let (cfg, db) = open_store(config_path).await?;
    let dead_band = cfg.trend_dead_band;
    let aggregator = PerformanceAggregator::new(Arc::new(db), Arc::new(ConfigManager::from_config(cfg)?));

    let range = TimeRange::last(chrono::Duration::days(args.days));

    if args.recompute {
        let written = aggregator.recompute_summaries(&range, args.granularity).await?;
        eprintln!("{}", format!("Recomputed {} stored summaries", written).dimmed());
    }

    let summaries = match &args.function {
        Some(function) => aggregator.function_summary(function, &range, args.granularity).await?,
        None => aggregator.get_performance_summary(&range, args.granularity).await?,
    };

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    if summaries.is_empty() {
        println!("{}", "No performance data in the selected range".yellow());
        return Ok(());
    }

    let mut by_function: BTreeMap<&str, Vec<&PerformanceSummary>> = BTreeMap::new();
    for summary in &summaries {
        by_function.entry(summary.function_name.as_str()).or_default().push(summary);
    }

    println!(
        "{}",
        format!("Performance by {} (last {} days)", args.granularity, args.days)
            .bold()
            .underline()
    );
    println!();

    for (function, buckets) in by_function {
        println!("{}", function.cyan().bold());
        println!(
            "  {:<12} {:>8} {:>9} {:>12} {:>12} {:>12}",
            "bucket", "calls", "success", "mean", "p90", "p99"
        );
        for s in &buckets {
            println!(
                "  {:<12} {:>8} {:>9} {:>12} {:>12} {:>12}",
                s.bucket_start.format("%Y-%m-%d"),
                format_number(s.count),
                format_rate(s.success_rate),
                format_duration(s.mean_ms),
                format_duration(s.p90_ms),
                format_duration(s.p99_ms),
            );
        }

        let owned: Vec<PerformanceSummary> = buckets.iter().map(|s| (*s).clone()).collect();
        println!(
            "  latency trend: {}   success trend: {}",
            format_trend(detect_trend(&owned, TrendMetric::MeanLatency, dead_band)),
            format_trend(detect_trend(&owned, TrendMetric::SuccessRate, dead_band)),
        );
        println!();
    }

    Ok(())
}

fn format_rate(rate: f64) -> String {
    let text = format!("{:.1}%", rate * 100.0);
    if rate >= 0.99 {
        text.green().to_string()
    } else if rate >= 0.9 {
        text.yellow().to_string()
    } else {
        text.red().to_string()
    }
}

fn format_trend(direction: TrendDirection) -> String {
    match direction {
        TrendDirection::Improving => "improving".green().to_string(),
        TrendDirection::Stable => "stable".normal().to_string(),
        TrendDirection::Regressing => "regressing".red().bold().to_string(),
    }
}
