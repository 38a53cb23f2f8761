//! Storage layer error type

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    /// `from` is later than `to`
    #[error("invalid 'from' & 'to'")]
    InvalidFromTo,

    /// Aggregator not in the domain allowed for the metric's flag
    #[error("invalid aggregator")]
    InvalidAggregator,

    /// Sample numeric kind does not match the metric's class
    #[error("invalid metric type")]
    InvalidMetricType,

    /// Metric id not present in the identity cache
    #[error("unknown metric ID")]
    UnknownMetricId,

    /// Operation attempted after shutdown
    #[error("storage is closed")]
    Closed,

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    /// IO error (including blocking-task failures)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Query timeout
    #[error("query timeout after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// Database schema is newer than this application understands
    #[error("database schema version {found} is newer than application version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    /// Migration failed
    #[error("migration to version {version} failed: {error}")]
    MigrationFailed { version: i64, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(StorageError::InvalidFromTo.to_string(), "invalid 'from' & 'to'");
        assert_eq!(
            StorageError::Timeout { timeout_secs: 30 }.to_string(),
            "query timeout after 30s"
        );
    }
}
