use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "callwatch", version, about = "Inspect and maintain a callwatch monitoring store")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "monitoring.json", global = true, env = "CALLWATCH_CONFIG")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Configuration management commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Query stored log entries
    Logs(crate::commands::logs::LogsArgs),

    /// Export log entries as JSON lines or CSV
    Export(crate::commands::export::ExportArgs),

    /// Show performance summaries per function
    Summary(crate::commands::summary::SummaryArgs),

    /// Run the retention sweep now
    Cleanup,

    /// Show store statistics and recent activity
    Status,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Display the effective configuration (webhook URL masked)
    Show,

    /// Validate the configuration file
    Validate,
}
