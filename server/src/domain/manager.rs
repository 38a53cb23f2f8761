//! Worker lifecycle
//!
//! Wires the scraper to the archiver through the bounded snapshot queue and
//! launches the query API, all under the shared cancellation root.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::api::ApiServer;
use crate::core::config::AppConfig;
use crate::core::constants::SNAPSHOT_QUEUE_CAPACITY;
use crate::core::shutdown::ShutdownService;
use crate::data::StorageService;

use super::archiver::Archiver;
use super::scraper::Scraper;
use super::snapshot::StatsSnapshot;
use super::stats::{ArchiverStats, ScraperStats};

pub struct Manager {
    shutdown: ShutdownService,
    storage: Arc<StorageService>,
    queue_tx: mpsc::Sender<StatsSnapshot>,

    pub scraper_stats: Arc<ScraperStats>,
    pub archiver_stats: Arc<ArchiverStats>,
}

impl Manager {
    /// Initialize storage and launch the configured workers. A storage
    /// initialization failure is fatal and propagates to the caller.
    pub async fn start(config: AppConfig, shutdown: ShutdownService) -> Result<Self> {
        let storage = StorageService::init(&config)
            .await
            .context("failed to initialize storage")?;

        shutdown
            .register(storage.start_reopen_listener(shutdown.subscribe()))
            .await;

        let (queue_tx, queue_rx) = mpsc::channel(SNAPSHOT_QUEUE_CAPACITY);
        let scraper_stats = Arc::new(ScraperStats::default());
        let archiver_stats = Arc::new(ArchiverStats::default());

        if config.scraper.enabled {
            let scraper = Scraper::new(
                config.scraper.clone(),
                queue_tx.clone(),
                Arc::clone(&scraper_stats),
            );
            shutdown.register(scraper.start(shutdown.subscribe())).await;

            let archiver = Archiver::new(Arc::clone(&storage), Arc::clone(&archiver_stats));
            shutdown
                .register(archiver.start(queue_rx, shutdown.subscribe()))
                .await;
        } else {
            tracing::debug!("Scraper disabled");
        }

        if config.api.enabled {
            let server = ApiServer::new(&config, Arc::clone(&storage));
            shutdown
                .register(server.start(shutdown.wait()).await?)
                .await;
        } else {
            tracing::debug!("API disabled");
        }

        tracing::debug!("Workers started");
        Ok(Self {
            shutdown,
            storage,
            queue_tx,
            scraper_stats,
            archiver_stats,
        })
    }

    /// Stop all workers, close storage, and report dropped snapshots.
    pub async fn stop(self) {
        self.shutdown.shutdown().await;

        if let Err(e) = self.storage.shutdown().await {
            tracing::error!(error = %e, "Failed to shutdown storage!");
        }

        // Snapshots still sitting in the queue are intentionally discarded:
        // this is best-effort monitoring, not an audit log.
        let pending = SNAPSHOT_QUEUE_CAPACITY - self.queue_tx.capacity();
        if pending > 0 {
            tracing::warn!(pending, "Snapshots dropped from queue during shutdown!");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.scraper.enabled = false;
        config.api.enabled = false;
        config.db.file = String::new();
        config
    }

    #[tokio::test]
    async fn test_start_stop_without_workers() {
        let shutdown = ShutdownService::new();
        let manager = Manager::start(test_config(), shutdown).await.unwrap();
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_start_stop_with_scraper() {
        let mut config = test_config();
        config.scraper.enabled = true;
        config.scraper.command = "echo '{}'".to_string();
        config.scraper.period_secs = 3600;

        let shutdown = ShutdownService::new();
        let manager = Manager::start(config, shutdown).await.unwrap();

        // Give the initial scrape a moment, then stop everything.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let stats = Arc::clone(&manager.scraper_stats);
        manager.stop().await;

        assert!(stats.execution_completed.get() + stats.execution_failed.get() >= 1);
    }

    #[tokio::test]
    async fn test_storage_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        // A directory is not a valid database file.
        config.db.file = dir.path().display().to_string();

        let shutdown = ShutdownService::new();
        let result = Manager::start(config, shutdown).await;
        assert!(result.is_err());
    }
}
