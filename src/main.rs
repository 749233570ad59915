use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use callwatch::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    // Operator output goes to stdout; keep library logging quiet unless asked
    init_tracing("warn", false);

    match args.command {
        cli::Commands::Config { action } => match action {
            cli::ConfigCommands::Show => commands::config::show(&args.config)?,
            cli::ConfigCommands::Validate => commands::config::validate(&args.config)?,
        },
        cli::Commands::Logs(logs) => commands::logs::execute(&args.config, logs).await?,
        cli::Commands::Export(export) => commands::export::execute(&args.config, export).await?,
        cli::Commands::Summary(summary) => commands::summary::execute(&args.config, summary).await?,
        cli::Commands::Cleanup => commands::cleanup::execute(&args.config).await?,
        cli::Commands::Status => commands::status::execute(&args.config).await?,
    }

    Ok(())
}
