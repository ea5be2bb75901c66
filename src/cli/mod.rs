pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a crawl for one registered source site
    Run {
        /// Registry id of the parent URL to crawl
        #[arg(long)]
        parent_url_id: String,

        /// Path to the per-site sitemap file (JSON or YAML)
        #[arg(long)]
        sitemap: PathBuf,

        /// Destination table for scraped records
        #[arg(long)]
        table: String,
    },

    /// Validate a sitemap file without crawling
    Validate {
        /// Path to the sitemap file to check
        #[arg(long)]
        sitemap: PathBuf,
    },

    /// Show the active application settings
    Config,
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command, returning the process exit code: 0 on success, 1
/// when any journey failed, 2 on configuration or registry defects.
pub async fn process_command(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run {
            parent_url_id,
            sitemap,
            table,
        } => {
            info!(
                "Running crawl for parent url {} into table {}",
                parent_url_id, table
            );
            commands::run(parent_url_id, sitemap, table).await
        }
        Commands::Validate { sitemap } => {
            info!("Validating sitemap {}", sitemap.display());
            commands::validate(sitemap).await
        }
        Commands::Config => commands::show_config().await,
    }
}
