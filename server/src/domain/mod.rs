pub mod archiver;
pub mod manager;
pub mod scraper;
pub mod snapshot;
pub mod stats;

pub use manager::Manager;
pub use snapshot::{MetricRecord, ParseError, StatsSnapshot, parse_snapshot};
