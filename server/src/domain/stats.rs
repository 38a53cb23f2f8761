//! Worker telemetry counters
//!
//! Plain atomic counters covering the same events the workers log. They are
//! cheap to keep hot and observable from tests.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Scraper worker counters.
#[derive(Debug, Default)]
pub struct ScraperStats {
    /// Successful stats command executions
    pub execution_completed: Counter,
    /// Failed stats command executions (spawn, timeout, cancellation, parse)
    pub execution_failed: Counter,
    /// Snapshots dropped because the queue was full
    pub queuing_failed: Counter,
}

/// Archiver worker counters.
#[derive(Debug, Default)]
pub struct ArchiverStats {
    /// Samples skipped because their timestamp did not advance
    pub out_of_order_samples: Counter,
    /// Counter resets detected
    pub reset_counters: Counter,
    /// Non-bitmap samples with the top bit set, stored truncated
    pub truncated_samples: Counter,
    /// Successful batch pushes
    pub push_completed: Counter,
    /// Failed batch pushes
    pub push_failed: Counter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increments() {
        let counter = Counter::default();
        assert_eq!(counter.get(), 0);
        counter.inc();
        counter.inc();
        assert_eq!(counter.get(), 2);
    }
}
