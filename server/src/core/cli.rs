use std::path::PathBuf;

use clap::Parser;

use super::constants::{
    ENV_CONFIG, ENV_DB_FILE, ENV_HOST, ENV_PORT, ENV_SCRAPER_COMMAND, ENV_SCRAPER_PERIOD,
};

#[derive(Parser, Debug, Default)]
#[command(name = "cachemon")]
#[command(version, about = "Cache server metrics collector and query API", long_about = None)]
pub struct Cli {
    /// Path to config file (JSON)
    #[arg(long, short = 'c', env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// API listen host address
    #[arg(long, short = 'H', env = ENV_HOST)]
    pub host: Option<String>,

    /// API listen port
    #[arg(long, short = 'p', env = ENV_PORT)]
    pub port: Option<u16>,

    /// Database file (empty string selects an in-memory database)
    #[arg(long, env = ENV_DB_FILE)]
    pub db_file: Option<String>,

    /// Stats command spawned by the scraper (shell-like syntax, environment
    /// variables expanded)
    #[arg(long, env = ENV_SCRAPER_COMMAND)]
    pub scraper_command: Option<String>,

    /// Scraper period in seconds
    #[arg(long, env = ENV_SCRAPER_PERIOD)]
    pub scraper_period: Option<u64>,

    /// Disable the scraper (query-only mode over an existing database)
    #[arg(long)]
    pub no_scraper: bool,

    /// Disable the query API
    #[arg(long)]
    pub no_api: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}
