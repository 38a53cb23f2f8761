// =============================================================================
// Application Identity
// =============================================================================

/// Application name in lowercase (for paths and identifiers)
pub const APP_NAME: &str = "cachemon";

/// Application version, baked in at compile time
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// VCS revision, injected by the release build; "unknown" for local builds
pub const APP_REVISION: &str = match option_env!("CACHEMON_REVISION") {
    Some(rev) => rev,
    None => "unknown",
};

// =============================================================================
// Environment Variables
// =============================================================================

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "CACHEMON_CONFIG";

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "CACHEMON_LOG";

/// Environment variable for server host
pub const ENV_HOST: &str = "CACHEMON_HOST";

/// Environment variable for server port
pub const ENV_PORT: &str = "CACHEMON_PORT";

/// Environment variable for the database file
pub const ENV_DB_FILE: &str = "CACHEMON_DB_FILE";

/// Environment variable for the stats command
pub const ENV_SCRAPER_COMMAND: &str = "CACHEMON_SCRAPER_COMMAND";

/// Environment variable for the scraper period (seconds)
pub const ENV_SCRAPER_PERIOD: &str = "CACHEMON_SCRAPER_PERIOD";

// =============================================================================
// Server Defaults
// =============================================================================

/// Default server host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default server port
pub const DEFAULT_PORT: u16 = 6100;

// =============================================================================
// Scraper Defaults
// =============================================================================

/// Default stats command spawned by the scraper
pub const DEFAULT_SCRAPER_COMMAND: &str = "/usr/bin/cachestat -1 -j";

/// Default scraper period in seconds
pub const DEFAULT_SCRAPER_PERIOD_SECS: u64 = 60;

/// Default scraper timeout in seconds
pub const DEFAULT_SCRAPER_TIMEOUT_SECS: u64 = 5;

// =============================================================================
// Database Defaults
// =============================================================================

/// Default database memory limit in MiB
pub const DEFAULT_DB_MEMORY_LIMIT_MIB: u64 = 512;

/// Default number of database threads
pub const DEFAULT_DB_THREADS: u64 = 1;

/// Default maximum size of the database temporary directory in MiB
pub const DEFAULT_DB_MAX_TEMP_DIRECTORY_SIZE_MIB: u64 = 128;

/// Timeout for a single blocking storage operation
pub const STORAGE_QUERY_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// Worker Defaults
// =============================================================================

/// Capacity of the bounded snapshot queue between scraper and archiver
pub const SNAPSHOT_QUEUE_CAPACITY: usize = 1024;

/// Maximum time to wait for background tasks during shutdown
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 30;
