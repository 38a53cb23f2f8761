//! Archiver worker
//!
//! Consumes snapshots from the queue, converts records into storable
//! samples, and pushes each snapshot as a single batch. Counters are stored
//! as per-second rates computed against the previously seen value; gauges,
//! bitmaps, and duration-formatted counters are stored raw.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::data::{MetricSample, SampleValue, StorageService};

use super::snapshot::StatsSnapshot;
use super::stats::ArchiverStats;

/// Values with the top bit set come from an upstream signed/unsigned
/// mix-up and are unreliable for anything but bitmaps.
const TOP_BIT: u64 = 0x8000_0000_0000_0000;
const VALUE_MASK: u64 = 0x7FFF_FFFF_FFFF_FFFF;

#[derive(Debug, Clone, Copy)]
struct LastSeen {
    timestamp: DateTime<Utc>,
    value: u64,
}

pub struct Archiver {
    storage: Arc<StorageService>,
    stats: Arc<ArchiverStats>,

    /// Previous observation per metric, for rate computation and ordering
    /// checks. Owned exclusively by this worker.
    last_seen: HashMap<String, LastSeen>,
}

impl Archiver {
    pub fn new(storage: Arc<StorageService>, stats: Arc<ArchiverStats>) -> Self {
        Self {
            storage,
            stats,
            last_seen: HashMap::new(),
        }
    }

    pub fn start(
        mut self,
        mut queue: mpsc::Receiver<StatsSnapshot>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    received = queue.recv() => {
                        match received {
                            Some(snapshot) => self.archive(snapshot).await,
                            None => break,
                        }
                    }
                }
            }
            tracing::debug!("Archiver shutdown complete");
        })
    }

    async fn archive(&mut self, snapshot: StatsSnapshot) {
        let timestamp = snapshot.timestamp;
        let batch = self.build_batch(&snapshot);
        if batch.is_empty() {
            return;
        }

        let size = batch.len();
        match self.storage.push_samples(timestamp, batch).await {
            Ok(()) => self.stats.push_completed.inc(),
            Err(e) => {
                self.stats.push_failed.inc();
                // The next snapshot is independent; drop this batch and
                // keep consuming.
                tracing::error!(
                    error = %e,
                    timestamp = %timestamp,
                    samples = size,
                    "Failed to store sample batch!"
                );
            }
        }
    }

    /// Convert one snapshot into storable samples, updating the last-seen
    /// map as a side effect.
    fn build_batch(&mut self, snapshot: &StatsSnapshot) -> Vec<MetricSample> {
        let timestamp = snapshot.timestamp;
        let mut batch = Vec::with_capacity(snapshot.items.len());

        for (name, record) in &snapshot.items {
            let previous = self.last_seen.get(name).copied();
            if previous.is_none() {
                self.last_seen.insert(
                    name.clone(),
                    LastSeen {
                        timestamp,
                        value: record.value,
                    },
                );
            }

            let value;
            if record.is_counter() && !record.has_duration_format() {
                // Counters are stored as rates, which needs two points; the
                // first observation only records the baseline. Uptime-style
                // counters ('d' format) are handled as gauges below since a
                // rate per second of an uptime is useless.
                let Some(previous) = previous else {
                    continue;
                };

                if timestamp <= previous.timestamp {
                    self.stats.out_of_order_samples.inc();
                    continue;
                }

                if record.value < previous.value {
                    // Counter reset: restart the baseline, emit nothing.
                    self.last_seen.insert(
                        name.clone(),
                        LastSeen {
                            timestamp,
                            value: record.value,
                        },
                    );
                    self.stats.reset_counters.inc();
                    continue;
                }

                let elapsed =
                    (timestamp - previous.timestamp).num_milliseconds() as f64 / 1000.0;
                value = SampleValue::Float64((record.value - previous.value) as f64 / elapsed);
            } else {
                // Not strictly necessary for non-counters, but keeps the
                // ordering rules consistent across kinds.
                if let Some(previous) = previous
                    && timestamp <= previous.timestamp
                {
                    self.stats.out_of_order_samples.inc();
                    continue;
                }

                if !record.is_bitmap() && record.value & TOP_BIT != 0 {
                    self.stats.truncated_samples.inc();
                }
                value = SampleValue::Uint64(record.value & VALUE_MASK);
            }

            if previous.is_some() {
                self.last_seen.insert(
                    name.clone(),
                    LastSeen {
                        timestamp,
                        value: record.value,
                    },
                );
            }

            batch.push(MetricSample {
                name: name.clone(),
                flag: record.flag.clone(),
                format: record.format.clone(),
                description: record.description.clone(),
                value,
            });
        }

        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::test_support::storage_test_config;
    use crate::domain::snapshot::MetricRecord;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn snapshot_with(timestamp: DateTime<Utc>, entries: &[(&str, MetricRecord)]) -> StatsSnapshot {
        StatsSnapshot {
            version: 1,
            timestamp,
            items: entries
                .iter()
                .map(|(name, record)| (name.to_string(), record.clone()))
                .collect(),
        }
    }

    fn record(flag: &str, format: &str, value: u64) -> MetricRecord {
        MetricRecord {
            description: "test metric".to_string(),
            flag: flag.to_string(),
            format: format.to_string(),
            value,
        }
    }

    async fn archiver() -> Archiver {
        let storage = StorageService::init(&storage_test_config()).await.unwrap();
        Archiver::new(storage, Arc::new(ArchiverStats::default()))
    }

    #[tokio::test]
    async fn test_first_seen_counter_records_baseline_only() {
        let mut archiver = archiver().await;
        let batch =
            archiver.build_batch(&snapshot_with(ts(1000), &[("MAIN.client_req", record("c", "i", 100))]));

        assert!(batch.is_empty(), "first counter observation emits no sample");
        assert!(archiver.last_seen.contains_key("MAIN.client_req"));
    }

    #[tokio::test]
    async fn test_counter_emits_rate() {
        let mut archiver = archiver().await;
        archiver.build_batch(&snapshot_with(ts(1000), &[("MAIN.client_req", record("c", "i", 100))]));
        let batch =
            archiver.build_batch(&snapshot_with(ts(1010), &[("MAIN.client_req", record("c", "i", 200))]));

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].value, SampleValue::Float64(10.0));
    }

    #[tokio::test]
    async fn test_monotonic_counter_rates_are_non_negative() {
        let mut archiver = archiver().await;
        let values = [100u64, 100, 150, 151, 400];
        let mut t = 1000;
        for v in values {
            let batch =
                archiver.build_batch(&snapshot_with(ts(t), &[("MAIN.client_req", record("c", "i", v))]));
            for sample in batch {
                match sample.value {
                    SampleValue::Float64(rate) => assert!(rate >= 0.0),
                    other => panic!("counter must emit a float64 rate, got {:?}", other),
                }
            }
            t += 10;
        }
    }

    #[tokio::test]
    async fn test_counter_reset_skips_and_rebaselines() {
        let mut archiver = archiver().await;
        archiver.build_batch(&snapshot_with(ts(1000), &[("MAIN.client_req", record("c", "i", 100))]));
        archiver.build_batch(&snapshot_with(ts(1010), &[("MAIN.client_req", record("c", "i", 200))]));

        // Reset: the value drops.
        let batch =
            archiver.build_batch(&snapshot_with(ts(1020), &[("MAIN.client_req", record("c", "i", 50))]));
        assert!(batch.is_empty());
        assert_eq!(archiver.stats.reset_counters.get(), 1);
        assert_eq!(archiver.last_seen["MAIN.client_req"].value, 50);

        // The next delta is computed from the new baseline.
        let batch =
            archiver.build_batch(&snapshot_with(ts(1030), &[("MAIN.client_req", record("c", "i", 150))]));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].value, SampleValue::Float64(10.0));
    }

    #[tokio::test]
    async fn test_out_of_order_snapshot_skipped() {
        let mut archiver = archiver().await;
        archiver.build_batch(&snapshot_with(ts(1000), &[
            ("MAIN.client_req", record("c", "i", 100)),
            ("MAIN.n_object", record("g", "i", 5)),
        ]));

        let batch = archiver.build_batch(&snapshot_with(ts(1000), &[
            ("MAIN.client_req", record("c", "i", 200)),
            ("MAIN.n_object", record("g", "i", 6)),
        ]));

        assert!(batch.is_empty());
        assert_eq!(archiver.stats.out_of_order_samples.get(), 2);
        // Last-seen keeps the original observation.
        assert_eq!(archiver.last_seen["MAIN.client_req"].value, 100);
    }

    #[tokio::test]
    async fn test_duration_counter_stored_as_gauge() {
        let mut archiver = archiver().await;
        let batch =
            archiver.build_batch(&snapshot_with(ts(1000), &[("MAIN.uptime", record("c", "d", 86400))]));

        // No rate, no baseline wait: the raw value is stored immediately.
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].value, SampleValue::Uint64(86400));
    }

    #[tokio::test]
    async fn test_gauge_top_bit_truncated() {
        let mut archiver = archiver().await;
        let batch = archiver.build_batch(&snapshot_with(
            ts(1000),
            &[("MAIN.n_object", record("g", "i", 0x8000_0000_0000_0001))],
        ));

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].value, SampleValue::Uint64(1));
        assert_eq!(archiver.stats.truncated_samples.get(), 1);
    }

    #[tokio::test]
    async fn test_bitmap_top_bit_kept_untruncated_count() {
        let mut archiver = archiver().await;
        let batch = archiver.build_batch(&snapshot_with(
            ts(1000),
            &[("MAIN.feature_bitmap", record("b", "b", 0x8000_0000_0000_0001))],
        ));

        // Bitmaps never count as truncated, though the stored value is
        // still masked.
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].value, SampleValue::Uint64(1));
        assert_eq!(archiver.stats.truncated_samples.get(), 0);
    }

    #[tokio::test]
    async fn test_worker_consumes_queue_and_stops() {
        let storage = StorageService::init(&storage_test_config()).await.unwrap();
        let stats = Arc::new(ArchiverStats::default());
        let archiver = Archiver::new(Arc::clone(&storage), Arc::clone(&stats));

        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = archiver.start(rx, shutdown_rx);

        tx.send(snapshot_with(ts(1000), &[("MAIN.n_object", record("g", "i", 7))]))
            .await
            .unwrap();

        // Wait for the batch to land.
        for _ in 0..100 {
            if stats.push_completed.get() > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(stats.push_completed.get(), 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("archiver should stop on shutdown")
            .unwrap();

        let range = storage.get_metrics(ts(990), ts(1010), 1).await.unwrap();
        assert_eq!(range.metrics.len(), 1);
        assert_eq!(range.metrics[0].name, "MAIN.n_object");
    }

    #[tokio::test]
    async fn test_push_failure_counted_and_worker_continues() {
        let storage = StorageService::init(&storage_test_config()).await.unwrap();
        let stats = Arc::new(ArchiverStats::default());
        let mut archiver = Archiver::new(Arc::clone(&storage), Arc::clone(&stats));

        // A batch against closed storage fails and is dropped.
        storage.shutdown().await.unwrap();
        archiver
            .archive(snapshot_with(ts(1000), &[("MAIN.n_object", record("g", "i", 1))]))
            .await;
        assert_eq!(stats.push_failed.get(), 1);

        // Subsequent snapshots are independent.
        storage.reinit().await.unwrap();
        archiver
            .archive(snapshot_with(ts(1010), &[("MAIN.n_object", record("g", "i", 2))]))
            .await;
        assert_eq!(stats.push_completed.get(), 1);
    }

    // Literal end-to-end scenarios, driven through the archiver into real
    // storage.

    #[tokio::test]
    async fn test_scenario_counter_rate_then_reset() {
        let storage = StorageService::init(&storage_test_config()).await.unwrap();
        let stats = Arc::new(ArchiverStats::default());
        let mut archiver = Archiver::new(Arc::clone(&storage), Arc::clone(&stats));

        // S1: two observations 10 seconds apart.
        archiver
            .archive(snapshot_with(ts(1000), &[("MAIN.client_req", record("c", "i", 100))]))
            .await;
        archiver
            .archive(snapshot_with(ts(1010), &[("MAIN.client_req", record("c", "i", 200))]))
            .await;

        let id = storage.get_metrics(ts(0), ts(2000), 1).await.unwrap().metrics[0].id;
        let series = storage
            .get_metric(id, ts(990), ts(1020), 10, "avg")
            .await
            .unwrap();
        assert_eq!(series.samples, vec![(1010, serde_json::json!(10.0))]);

        // S2: a reset emits nothing and leaves the series unchanged.
        archiver
            .archive(snapshot_with(ts(1020), &[("MAIN.client_req", record("c", "i", 50))]))
            .await;

        let series = storage
            .get_metric(id, ts(990), ts(1030), 10, "avg")
            .await
            .unwrap();
        assert_eq!(series.samples, vec![(1010, serde_json::json!(10.0))]);
        assert_eq!(stats.reset_counters.get(), 1);
    }

    #[tokio::test]
    async fn test_scenario_bitmap_round_trip() {
        let storage = StorageService::init(&storage_test_config()).await.unwrap();
        let stats = Arc::new(ArchiverStats::default());
        let mut archiver = Archiver::new(Arc::clone(&storage), Arc::clone(&stats));

        // S3.
        archiver
            .archive(snapshot_with(
                ts(2000),
                &[("MAIN.feature_bitmap", record("b", "b", 0xDEAD_BEEF))],
            ))
            .await;

        let id = storage.get_metrics(ts(0), ts(3000), 1).await.unwrap().metrics[0].id;
        let series = storage
            .get_metric(id, ts(1990), ts(2010), 1, "last")
            .await
            .unwrap();
        assert_eq!(series.samples, vec![(2000, serde_json::json!("deadbeef"))]);
    }

    #[tokio::test]
    async fn test_scenario_top_bit_truncation_stored() {
        let storage = StorageService::init(&storage_test_config()).await.unwrap();
        let stats = Arc::new(ArchiverStats::default());
        let mut archiver = Archiver::new(Arc::clone(&storage), Arc::clone(&stats));

        // S6.
        archiver
            .archive(snapshot_with(
                ts(1000),
                &[("MAIN.n_object", record("g", "i", 0x8000_0000_0000_0001))],
            ))
            .await;

        let id = storage.get_metrics(ts(0), ts(2000), 1).await.unwrap().metrics[0].id;
        let series = storage
            .get_metric(id, ts(990), ts(1010), 1, "last")
            .await
            .unwrap();
        assert_eq!(series.samples, vec![(1000, serde_json::json!(1u64))]);
        assert_eq!(stats.truncated_samples.get(), 1);
    }
}
