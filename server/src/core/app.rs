//! Core application

use anyhow::{Context, Result};

use crate::core::cli;
use crate::core::config::AppConfig;
use crate::core::constants::{APP_NAME, APP_REVISION, APP_VERSION, ENV_LOG};
use crate::core::shutdown::ShutdownService;
use crate::domain::Manager;

pub struct CoreApp;

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        let cli = cli::parse();
        let config = AppConfig::load(&cli)?;

        tracing::info!(
            version = APP_VERSION,
            revision = APP_REVISION,
            "Application starting"
        );

        let shutdown = ShutdownService::new();
        shutdown.install_signal_handlers();

        let manager = Manager::start(config, shutdown.clone())
            .await
            .context("failed to start workers")?;

        shutdown.wait().await;
        manager.stop().await;

        tracing::info!("Application stopped");
        Ok(())
    }

    fn init_logging() {
        let default_filter = format!("info,{}=info", APP_NAME);

        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }
}
