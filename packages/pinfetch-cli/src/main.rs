use clap::{Parser, Subcommand};
use eyre::Context;
use pinfetch::FetchOptions;
use std::path::PathBuf;

use crate::{
    fetch::FetchArgs,
    logging::{LoggingConfig, init_logging},
};

mod check;
mod fetch;
mod logging;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a JSON fetch options file, options are loaded from the
    /// environment when not provided
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a URL without fetching it
    Check {
        /// URL to validate
        url: String,
    },

    /// Fetch a URL, validating it and every redirect
    Fetch {
        /// URL to fetch
        url: String,

        /// Request method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Request header in the form 'name: value'
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Request body
        #[arg(short, long)]
        data: Option<String>,

        /// Maximum number of redirects to follow
        #[arg(long)]
        max_redirects: Option<usize>,

        /// Print the status, headers and attempt chain
        #[arg(short, long)]
        include: bool,
    },
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // Load environment variables
    _ = dotenvy::dotenv();

    // Setup colorful error logging
    color_eyre::install()?;

    let logging = LoggingConfig::from_env().context("failed to load logging config")?;
    init_logging(logging);

    let args = Args::parse();

    let options = match args.config {
        Some(path) => {
            let config_raw = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_slice::<FetchOptions>(&config_raw).context("failed to parse config")?
        }
        None => FetchOptions::from_env().context("failed to load options from environment")?,
    };

    match args.command {
        Commands::Check { url } => check::check(options, url).await,
        Commands::Fetch {
            url,
            method,
            headers,
            data,
            max_redirects,
            include,
        } => {
            fetch::fetch(
                options,
                FetchArgs {
                    url,
                    method,
                    headers,
                    data,
                    max_redirects,
                    include,
                },
            )
            .await
        }
    }
}
