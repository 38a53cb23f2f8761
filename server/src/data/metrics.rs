//! Metric persistence and aggregated queries

use std::sync::Arc;

use chrono::{DateTime, Utc};
use duckdb::{Connection, params};
use serde::Serialize;

use super::cache::{CachedMetric, MetricClass};
use super::error::StorageError;
use super::sql_types::SqlTimestamp;
use super::{StorageService, in_transaction};

/// Aggregators allowed for bitmap metrics (`flag == "b"`).
const BITMAP_AGGREGATORS: &[&str] = &["first", "last", "bit_and", "bit_or", "bit_xor", "count"];

/// Aggregators allowed for every other metric.
const SCALAR_AGGREGATORS: &[&str] = &["avg", "min", "max", "first", "last", "count"];

/// One sample value, discriminated by the metric's class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleValue {
    Uint64(u64),
    Float64(f64),
}

impl SampleValue {
    pub fn class(&self) -> MetricClass {
        match self {
            SampleValue::Uint64(_) => MetricClass::Uint64,
            SampleValue::Float64(_) => MetricClass::Float64,
        }
    }
}

/// One storable sample, together with the metric identity it belongs to.
#[derive(Debug, Clone)]
pub struct MetricSample {
    pub name: String,
    pub flag: String,
    pub format: String,
    pub description: String,
    pub value: SampleValue,
}

/// Metric descriptor projected from the identity cache.
#[derive(Debug, Clone, Serialize)]
pub struct MetricInfo {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub flag: String,
    pub format: String,
}

/// Metrics with at least one sample in the normalized time range.
#[derive(Debug, Serialize)]
pub struct MetricsRange {
    pub from: i64,
    pub to: i64,
    pub step: u64,
    pub metrics: Vec<MetricInfo>,
}

/// Aggregated series for one metric over the normalized time range.
#[derive(Debug, Serialize)]
pub struct MetricSeries {
    pub from: i64,
    pub to: i64,
    pub step: u64,
    pub samples: Vec<(i64, serde_json::Value)>,
}

impl StorageService {
    /// Insert a batch of samples sharing a single timestamp, in one
    /// transaction. Metric rows are upserted as needed, preserving ids.
    pub async fn push_samples(
        self: &Arc<Self>,
        timestamp: DateTime<Utc>,
        samples: Vec<MetricSample>,
    ) -> Result<(), StorageError> {
        if samples.is_empty() {
            return Ok(());
        }
        let svc = Arc::clone(self);
        Self::run(move || svc.push_samples_blocking(timestamp, &samples)).await
    }

    fn push_samples_blocking(
        &self,
        timestamp: DateTime<Utc>,
        samples: &[MetricSample],
    ) -> Result<(), StorageError> {
        // The slot read lock is held for the whole operation: the connection
        // is not replaced, so reinit/shutdown are the only writers.
        let slot = self.db.read();
        let conn = slot.as_ref().ok_or(StorageError::Closed)?.lock();

        // Metrics upserted by this batch are installed into the identity
        // cache only after the transaction commits. Installing earlier would
        // leave the cache pointing at rolled-back rows, and every later push
        // of such a metric would reuse a `metrics.id` that does not exist.
        let mut created: Vec<Arc<CachedMetric>> = Vec::new();

        in_transaction(&conn, |conn| {
            let mut upsert = conn.prepare(
                "INSERT INTO metrics (id, name, flag, format, description, class) \
                 VALUES ( \
                     COALESCE((SELECT id FROM metrics WHERE name = ?), NEXTVAL('metrics_seq')), \
                     ?, ?, ?, ?, ?) \
                 ON CONFLICT(name) DO UPDATE SET \
                     flag = excluded.flag, \
                     format = excluded.format, \
                     description = excluded.description \
                 RETURNING id",
            )?;
            let mut insert_uint64 = conn.prepare(
                "INSERT INTO metric_values (metric_id, timestamp, value) \
                 VALUES (?, ?, union_value(uint64 := ?))",
            )?;
            let mut insert_float64 = conn.prepare(
                "INSERT INTO metric_values (metric_id, timestamp, value) \
                 VALUES (?, ?, union_value(float64 := ?))",
            )?;

            for sample in samples {
                // Metrics pending from earlier samples in this batch take
                // precedence over the (committed-state) cache.
                let known = created
                    .iter()
                    .find(|m| m.name == sample.name)
                    .cloned()
                    .or_else(|| self.cache.read().get_by_name(&sample.name));

                let metric = match &known {
                    Some(m)
                        if m.flag == sample.flag
                            && m.format == sample.format
                            && m.description == sample.description =>
                    {
                        Arc::clone(m)
                    }
                    _ => {
                        // The class is fixed at metric creation; a sample of
                        // the other numeric kind is rejected before touching
                        // the union arm.
                        let class = sample.value.class();
                        if let Some(m) = &known
                            && m.class != class
                        {
                            return Err(StorageError::InvalidMetricType);
                        }

                        let id: i64 = upsert.query_row(
                            params![
                                sample.name,
                                sample.name,
                                sample.flag,
                                sample.format,
                                sample.description,
                                class.as_str(),
                            ],
                            |row| row.get(0),
                        )?;

                        let metric = Arc::new(CachedMetric {
                            id,
                            name: sample.name.clone(),
                            flag: sample.flag.clone(),
                            format: sample.format.clone(),
                            description: sample.description.clone(),
                            class,
                        });

                        created.push(Arc::clone(&metric));
                        metric
                    }
                };

                match (metric.class, sample.value) {
                    (MetricClass::Uint64, SampleValue::Uint64(v)) => {
                        insert_uint64.execute(params![metric.id, SqlTimestamp(timestamp), v])?;
                    }
                    (MetricClass::Float64, SampleValue::Float64(v)) => {
                        insert_float64.execute(params![metric.id, SqlTimestamp(timestamp), v])?;
                    }
                    _ => return Err(StorageError::InvalidMetricType),
                }
            }

            Ok(())
        })?;

        // The batch is committed: mirror it into the cache. Locking order:
        // the db slot was read-locked first.
        let mut cache = self.cache.write();
        for metric in created {
            cache.insert(metric);
        }
        cache.observe_timestamp(timestamp);

        Ok(())
    }

    /// List metrics with at least one sample inside the normalized range.
    pub async fn get_metrics(
        self: &Arc<Self>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        step: u64,
    ) -> Result<MetricsRange, StorageError> {
        if from > to {
            return Err(StorageError::InvalidFromTo);
        }
        let svc = Arc::clone(self);
        Self::run_query(move || svc.get_metrics_blocking(from, to, step)).await
    }

    fn get_metrics_blocking(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        step: u64,
    ) -> Result<MetricsRange, StorageError> {
        let slot = self.db.read();
        let conn = slot.as_ref().ok_or(StorageError::Closed)?.lock();

        let (from_s, to_s, step) = self.normalize(&conn, from, to, step)?;

        let mut stmt = conn.prepare(
            "SELECT DISTINCT metric_id \
             FROM metric_values \
             WHERE epoch(timestamp) >= ? AND epoch(timestamp) < ? \
             ORDER BY metric_id",
        )?;
        let mut rows = stmt.query(params![from_s, to_s])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            ids.push(row.get::<_, i64>(0)?);
        }

        let cache = self.cache.read();
        let mut metrics = Vec::with_capacity(ids.len());
        for id in ids {
            match cache.get_by_id(id) {
                Some(m) => metrics.push(MetricInfo {
                    id: m.id,
                    name: m.name.clone(),
                    description: m.description.clone(),
                    flag: m.flag.clone(),
                    format: m.format.clone(),
                }),
                None => tracing::warn!(id, "Unknown metric ID in 'metric_values' table"),
            }
        }

        Ok(MetricsRange {
            from: from_s,
            to: to_s,
            step,
            metrics,
        })
    }

    /// Aggregated series for one metric.
    pub async fn get_metric(
        self: &Arc<Self>,
        id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        step: u64,
        aggregator: &str,
    ) -> Result<MetricSeries, StorageError> {
        if from > to {
            return Err(StorageError::InvalidFromTo);
        }

        let metric = self
            .cache
            .read()
            .get_by_id(id)
            .ok_or(StorageError::UnknownMetricId)?;

        let aggregator = validate_aggregator(&metric.flag, aggregator)?;

        let svc = Arc::clone(self);
        Self::run_query(move || svc.get_metric_blocking(metric, from, to, step, aggregator)).await
    }

    fn get_metric_blocking(
        &self,
        metric: Arc<CachedMetric>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        step: u64,
        aggregator: &'static str,
    ) -> Result<MetricSeries, StorageError> {
        let slot = self.db.read();
        let conn = slot.as_ref().ok_or(StorageError::Closed)?.lock();

        let (from_s, to_s, step) = self.normalize(&conn, from, to, step)?;

        // The aggregator is a whitelisted token and the class a fixed enum,
        // so the interpolation cannot carry anything else into the SQL.
        // Post-aggregation value types vary (e.g. 'avg' over the uint64 arm
        // yields a double, 'count' an int64); rows are read as dynamic
        // values and converted per metric.
        let sql = format!(
            "SELECT epoch(time_bucket(INTERVAL '{step} seconds', timestamp))::BIGINT AS bucket, \
                    {aggregator}(value.{class}) AS value \
             FROM metric_values \
             WHERE metric_id = ? AND epoch(timestamp) >= ? AND epoch(timestamp) < ? \
             GROUP BY bucket \
             ORDER BY bucket",
            class = metric.class,
        );

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![metric.id, from_s, to_s])?;
        let mut samples = Vec::new();
        while let Some(row) = rows.next()? {
            let bucket: i64 = row.get(0)?;
            let value: duckdb::types::Value = row.get(1)?;
            samples.push((bucket, metric.format_value(value)));
        }

        Ok(MetricSeries {
            from: from_s,
            to: to_s,
            step,
            samples,
        })
    }

    /// Normalize `(from, to, step)`: raise `step` to the scraper period and
    /// snap the range outward to step boundaries. The bucketing is done by
    /// the database with the same `time_bucket` call used by aggregation, so
    /// the two can never disagree.
    fn normalize(
        &self,
        conn: &Connection,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        step: u64,
    ) -> Result<(i64, i64, u64), StorageError> {
        let step = step.max(self.period_secs).max(1);

        let sql = format!(
            "SELECT \
                 epoch(time_bucket(INTERVAL '{step} seconds', ?::TIMESTAMP))::BIGINT, \
                 epoch(time_bucket(INTERVAL '{step} seconds', ?::TIMESTAMP) \
                       + INTERVAL '{step} seconds')::BIGINT",
        );
        let (from_s, to_s) = conn.query_row(
            &sql,
            params![SqlTimestamp(from), SqlTimestamp(to)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok((from_s, to_s, step))
    }
}

fn validate_aggregator(flag: &str, aggregator: &str) -> Result<&'static str, StorageError> {
    let allowed = if flag == "b" {
        BITMAP_AGGREGATORS
    } else {
        SCALAR_AGGREGATORS
    };
    let lower = aggregator.to_lowercase();
    allowed
        .iter()
        .find(|a| **a == lower)
        .copied()
        .ok_or(StorageError::InvalidAggregator)
}
