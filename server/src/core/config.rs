//! Application configuration
//!
//! Defaults come from `constants`, optionally overlaid with a JSON config
//! file and then with CLI flags / environment variables.

use std::fs;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::utils::env::expand_env;

use super::cli::Cli;
use super::constants::{
    DEFAULT_DB_MAX_TEMP_DIRECTORY_SIZE_MIB, DEFAULT_DB_MEMORY_LIMIT_MIB, DEFAULT_DB_THREADS,
    DEFAULT_HOST, DEFAULT_PORT, DEFAULT_SCRAPER_COMMAND, DEFAULT_SCRAPER_PERIOD_SECS,
    DEFAULT_SCRAPER_TIMEOUT_SECS,
};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub scraper: ScraperConfig,
    pub db: DbConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Basic-auth credential. Authentication is enforced only when both
    /// username and password are non-empty.
    pub basic_auth_username: String,
    pub basic_auth_password: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            basic_auth_username: String::new(),
            basic_auth_password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub enabled: bool,
    /// Stats command in shell-like syntax. Environment variables are
    /// expanded before tokenization.
    pub command: String,
    pub period_secs: u64,
    pub timeout_secs: u64,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: DEFAULT_SCRAPER_COMMAND.to_string(),
            period_secs: DEFAULT_SCRAPER_PERIOD_SECS,
            timeout_secs: DEFAULT_SCRAPER_TIMEOUT_SECS,
        }
    }
}

impl ScraperConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    /// Tokenize the configured command into an argv vector.
    pub fn argv(&self) -> Result<Vec<String>> {
        let expanded = expand_env(&self.command);
        let argv = shlex::split(&expanded)
            .with_context(|| format!("failed to split stats command: {}", self.command))?;
        if argv.is_empty() {
            bail!("empty stats command");
        }
        Ok(argv)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DbConfig {
    /// Database file. An empty string selects an in-memory database.
    pub file: String,
    pub memory_limit_mib: u64,
    pub threads: u64,
    /// Spill directory for the database. Defaults to `<file>.tmp`.
    pub temp_directory: Option<String>,
    pub max_temp_directory_size_mib: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            file: String::new(),
            memory_limit_mib: DEFAULT_DB_MEMORY_LIMIT_MIB,
            threads: DEFAULT_DB_THREADS,
            temp_directory: None,
            max_temp_directory_size_mib: DEFAULT_DB_MAX_TEMP_DIRECTORY_SIZE_MIB,
        }
    }
}

impl DbConfig {
    pub fn temp_directory(&self) -> String {
        match &self.temp_directory {
            Some(dir) => dir.clone(),
            None => format!("{}.tmp", self.file),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl AppConfig {
    /// Load configuration: defaults, then the optional config file, then CLI
    /// flags and environment variables.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file: {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("failed to parse config file: {}", path.display()))?
            }
            None => Self::default(),
        };

        if let Some(host) = &cli.host {
            config.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            config.server.port = port;
        }
        if let Some(file) = &cli.db_file {
            config.db.file = file.clone();
        }
        if let Some(command) = &cli.scraper_command {
            config.scraper.command = command.clone();
        }
        if let Some(period) = cli.scraper_period {
            config.scraper.period_secs = period;
        }
        if cli.no_scraper {
            config.scraper.enabled = false;
        }
        if cli.no_api {
            config.api.enabled = false;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.scraper.enabled {
            if self.scraper.period_secs == 0 {
                bail!("scraper period must be at least one second");
            }
            if self.scraper.timeout_secs == 0 {
                bail!("scraper timeout must be at least one second");
            }
            self.scraper.argv()?;
        }
        if self.db.memory_limit_mib == 0 || self.db.threads == 0 {
            bail!("database memory limit and threads must be positive");
        }
        Ok(())
    }

    /// Scraper period in seconds when the scraper is enabled, `1` otherwise.
    /// Used as the lower bound for query step normalization.
    pub fn effective_period_secs(&self) -> u64 {
        if self.scraper.enabled {
            self.scraper.period_secs
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, DEFAULT_HOST);
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert!(config.scraper.enabled);
        assert_eq!(config.scraper.period_secs, DEFAULT_SCRAPER_PERIOD_SECS);
        assert!(config.db.file.is_empty());
        assert!(config.api.enabled);
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli {
            host: Some("0.0.0.0".to_string()),
            port: Some(7000),
            db_file: Some("/tmp/cachemon.db".to_string()),
            scraper_command: Some("echo '{}'".to_string()),
            scraper_period: Some(10),
            ..Default::default()
        };
        let config = AppConfig::load(&cli).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.db.file, "/tmp/cachemon.db");
        assert_eq!(config.scraper.period_secs, 10);
    }

    #[test]
    fn test_argv_tokenization() {
        let scraper = ScraperConfig {
            command: "/usr/bin/cachestat -1 -j -f 'MAIN.*'".to_string(),
            ..Default::default()
        };
        let argv = scraper.argv().unwrap();
        assert_eq!(argv, vec!["/usr/bin/cachestat", "-1", "-j", "-f", "MAIN.*"]);
    }

    #[test]
    fn test_argv_env_expansion() {
        unsafe { std::env::set_var("CACHEMON_TEST_BIN", "/opt/bin/stats") };
        let scraper = ScraperConfig {
            command: "${CACHEMON_TEST_BIN} -j".to_string(),
            ..Default::default()
        };
        let argv = scraper.argv().unwrap();
        assert_eq!(argv[0], "/opt/bin/stats");
    }

    #[test]
    fn test_empty_command_rejected() {
        let scraper = ScraperConfig {
            command: "   ".to_string(),
            ..Default::default()
        };
        assert!(scraper.argv().is_err());
    }

    #[test]
    fn test_effective_period_when_scraper_disabled() {
        let mut config = AppConfig::default();
        config.scraper.enabled = false;
        assert_eq!(config.effective_period_secs(), 1);
    }

    #[test]
    fn test_temp_directory_default() {
        let db = DbConfig {
            file: "/var/lib/cachemon/db".to_string(),
            ..Default::default()
        };
        assert_eq!(db.temp_directory(), "/var/lib/cachemon/db.tmp");
    }
}
