//! Storage engine on top of embedded DuckDB
//!
//! Owns the database connection and the metric identity cache, and exposes
//! the push-samples and aggregated query operations. The connection can be
//! closed and reopened in place on a reopen signal (SIGHUP) without
//! restarting the process.

pub mod cache;
pub mod error;
mod metrics;
mod migrations;
pub mod schema;
mod sql_types;

pub use cache::{CachedMetric, MetricClass, MetricCache};
pub use error::StorageError;
pub use metrics::{MetricInfo, MetricSample, MetricSeries, MetricsRange, SampleValue};

use std::sync::Arc;
use std::time::{Duration, Instant};

use duckdb::Connection;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::config::{AppConfig, DbConfig};
use crate::core::constants::STORAGE_QUERY_TIMEOUT_SECS;

/// Storage service.
///
/// Locking order: `db` -> `cache`. Never acquire the db slot while holding
/// the cache lock.
///
/// The outer `RwLock` on `db` protects the *slot*: replacing the connection
/// (`reinit`/`shutdown`) takes it write, every other operation takes it read.
/// The inner `Mutex` serializes use of the connection itself, which is `Send`
/// but not `Sync`.
pub struct StorageService {
    db_config: DbConfig,

    /// Lower bound for query step normalization: the scraper period when the
    /// scraper is enabled, one second otherwise.
    period_secs: u64,

    db: RwLock<Option<Mutex<Connection>>>,
    cache: RwLock<MetricCache>,
}

impl StorageService {
    /// Open the database, apply configuration and schema, and load the
    /// identity cache. Failure here is fatal to the process.
    pub async fn init(config: &AppConfig) -> Result<Arc<Self>, StorageError> {
        let service = Arc::new(Self {
            db_config: config.db.clone(),
            period_secs: config.effective_period_secs(),
            db: RwLock::new(None),
            cache: RwLock::new(MetricCache::default()),
        });

        let svc = Arc::clone(&service);
        Self::run(move || svc.reinit_blocking()).await?;

        Ok(service)
    }

    /// Close and reopen the database file in place, reapplying configuration
    /// and reloading the cache.
    pub async fn reinit(self: &Arc<Self>) -> Result<(), StorageError> {
        let svc = Arc::clone(self);
        Self::run(move || svc.reinit_blocking()).await
    }

    /// Close the database and clear the cache.
    pub async fn shutdown(self: &Arc<Self>) -> Result<(), StorageError> {
        let svc = Arc::clone(self);
        Self::run(move || svc.shutdown_blocking()).await
    }

    /// Hostname captured at first database initialization.
    pub fn hostname(&self) -> String {
        self.cache.read().hostname().to_string()
    }

    /// Earliest sample timestamp, `None` when the database is empty.
    pub fn earliest(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.cache.read().earliest()
    }

    /// Latest sample timestamp, `None` when the database is empty.
    pub fn latest(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.cache.read().latest()
    }

    /// Listen for SIGHUP and reinitialize storage on each receipt. Intended
    /// for database file rotation on long-running deployments.
    pub fn start_reopen_listener(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let storage = Arc::clone(self);
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                let mut hangup = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::hangup(),
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to install SIGHUP handler");
                        return;
                    }
                };

                tracing::debug!("Started storage reopen listener");
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        _ = hangup.recv() => {
                            tracing::info!("Got reopen signal: reinitializing database");
                            if let Err(e) = storage.reinit().await {
                                tracing::error!(error = %e, "Failed to reinitialize storage!");
                            }
                        }
                    }
                }
                tracing::debug!("Stopped storage reopen listener");
            }

            #[cfg(not(unix))]
            {
                let _ = shutdown_rx.wait_for(|&v| v).await;
            }
        })
    }

    fn reinit_blocking(&self) -> Result<(), StorageError> {
        // Locking order: 'db' -> 'cache'.
        let mut slot = self.db.write();
        let mut cache = self.cache.write();

        let start = Instant::now();
        tracing::info!(
            file = %self.db_label(),
            "Initializing database & cache. This may take a while"
        );

        if let Some(old) = slot.take()
            && let Err((_, e)) = old.into_inner().close()
        {
            tracing::warn!(error = %e, "Failed to close database before reopen");
        }

        let conn = self.open_connection()?;
        migrations::run(&conn)?;
        cache.reload(&conn)?;
        self.log_db_info(&conn);
        *slot = Some(Mutex::new(conn));

        tracing::info!(
            file = %self.db_label(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Database & cache have been successfully initialized"
        );
        Ok(())
    }

    fn shutdown_blocking(&self) -> Result<(), StorageError> {
        // Locking order: 'db' -> 'cache'.
        let mut slot = self.db.write();
        let mut cache = self.cache.write();

        if let Some(conn) = slot.take() {
            conn.into_inner()
                .close()
                .map_err(|(_, e)| StorageError::Database(e))?;
        }
        cache.clear();
        Ok(())
    }

    fn open_connection(&self) -> Result<Connection, StorageError> {
        // An in-memory database is used when no file is configured.
        let conn = if self.db_config.file.is_empty() {
            Connection::open_in_memory()?
        } else {
            Connection::open(&self.db_config.file)?
        };

        conn.execute_batch(&format!(
            "SET autoinstall_known_extensions = false;\n\
             SET autoload_known_extensions = false;\n\
             SET memory_limit = '{}MiB';\n\
             SET threads = {};\n\
             SET temp_directory = '{}';\n\
             SET max_temp_directory_size = '{}MiB';",
            self.db_config.memory_limit_mib,
            self.db_config.threads,
            self.db_config.temp_directory(),
            self.db_config.max_temp_directory_size_mib,
        ))?;

        Ok(conn)
    }

    fn log_db_info(&self, conn: &Connection) {
        let info = conn.query_row(
            "SELECT database_size, wal_size, memory_usage, memory_limit \
             FROM pragma_database_size() \
             LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        );
        match info {
            Ok((database_size, wal_size, memory_usage, memory_limit)) => {
                tracing::info!(%database_size, %wal_size, %memory_usage, %memory_limit, "Database ready");
            }
            Err(e) => tracing::warn!(error = %e, "Failed to query database size"),
        }
    }

    fn db_label(&self) -> &str {
        if self.db_config.file.is_empty() {
            ":memory:"
        } else {
            &self.db_config.file
        }
    }

    /// Run a blocking storage operation to completion on the blocking pool.
    /// Used for writes and lifecycle operations, which must not be abandoned
    /// mid-transaction.
    pub(crate) async fn run<T, F>(f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
    }

    /// Run a blocking read query with a timeout.
    pub(crate) async fn run_query<T, F>(f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    {
        let timeout = Duration::from_secs(STORAGE_QUERY_TIMEOUT_SECS);
        tokio::time::timeout(timeout, tokio::task::spawn_blocking(f))
            .await
            .map_err(|_| {
                tracing::warn!("Storage query timed out after {}s", STORAGE_QUERY_TIMEOUT_SECS);
                StorageError::Timeout {
                    timeout_secs: STORAGE_QUERY_TIMEOUT_SECS,
                }
            })?
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
    }

    #[cfg(test)]
    pub(crate) fn is_open(&self) -> bool {
        self.db.read().is_some()
    }
}

/// Execute a function within a transaction, rolling back on error.
pub(crate) fn in_transaction<F, T>(conn: &Connection, f: F) -> Result<T, StorageError>
where
    F: FnOnce(&Connection) -> Result<T, StorageError>,
{
    conn.execute_batch("BEGIN TRANSACTION")?;
    match f(conn) {
        Ok(val) => {
            conn.execute_batch("COMMIT")?;
            Ok(val)
        }
        Err(e) => {
            if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                tracing::warn!("ROLLBACK failed after transaction error: {}", rollback_err);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::core::config::AppConfig;

    /// Config for storage tests: in-memory database, workers disabled.
    pub fn storage_test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.scraper.enabled = false;
        config.api.enabled = false;
        config.db.file = String::new();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::storage_test_config;
    use super::*;

    #[tokio::test]
    async fn test_init_in_memory() {
        let storage = StorageService::init(&storage_test_config()).await.unwrap();
        assert!(storage.is_open());
        assert!(!storage.hostname().is_empty());
        assert!(storage.earliest().is_none());
        assert!(storage.latest().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_clears_state() {
        let storage = StorageService::init(&storage_test_config()).await.unwrap();
        storage.shutdown().await.unwrap();
        assert!(!storage.is_open());
        assert!(storage.hostname().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_twice_is_noop() {
        let storage = StorageService::init(&storage_test_config()).await.unwrap();
        storage.shutdown().await.unwrap();
        storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_init_file_backed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = storage_test_config();
        config.db.file = dir.path().join("metrics.db").display().to_string();

        let storage = StorageService::init(&config).await.unwrap();
        assert!(storage.is_open());
        storage.shutdown().await.unwrap();

        assert!(dir.path().join("metrics.db").exists());
    }

    #[tokio::test]
    async fn test_reinit_preserves_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = storage_test_config();
        config.db.file = dir.path().join("metrics.db").display().to_string();

        let storage = StorageService::init(&config).await.unwrap();
        let hostname = storage.hostname();

        storage.reinit().await.unwrap();
        assert_eq!(storage.hostname(), hostname);
        assert!(storage.is_open());

        storage.shutdown().await.unwrap();
    }
}
