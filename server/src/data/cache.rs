//! In-memory identity cache for known metrics
//!
//! Avoids hitting the database for metric details and other mostly-static
//! information (hostname, earliest/latest sample timestamps). Entries are
//! shared between the by-id and by-name maps.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use duckdb::Connection;

use super::error::StorageError;

/// Numeric arm a metric's values are stored in. Fixed at metric creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricClass {
    Uint64,
    Float64,
}

impl MetricClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricClass::Uint64 => "uint64",
            MetricClass::Float64 => "float64",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uint64" => Some(MetricClass::Uint64),
            "float64" => Some(MetricClass::Float64),
            _ => None,
        }
    }
}

impl fmt::Display for MetricClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct CachedMetric {
    pub id: i64,
    pub name: String,
    pub flag: String,
    pub format: String,
    pub description: String,
    pub class: MetricClass,
}

impl CachedMetric {
    /// Convert a post-aggregation value into its JSON representation.
    ///
    /// Aggregated bitmaps can come back as uint64 (e.g. `last`) or int64
    /// (e.g. `count`); the hex representation is only useful for the uint64
    /// case.
    pub fn format_value(&self, value: duckdb::types::Value) -> serde_json::Value {
        use duckdb::types::Value;

        if self.format == "b"
            && let Value::UBigInt(v) = value
        {
            return serde_json::Value::String(format!("{:x}", v));
        }

        match value {
            Value::UBigInt(v) => serde_json::json!(v),
            Value::BigInt(v) => serde_json::json!(v),
            Value::Int(v) => serde_json::json!(v),
            Value::UInt(v) => serde_json::json!(v),
            Value::Double(v) => serde_json::json!(v),
            Value::Float(v) => serde_json::json!(v),
            Value::Null => serde_json::Value::Null,
            other => {
                tracing::warn!(value = ?other, metric = %self.name, "Unexpected aggregated value type");
                serde_json::Value::Null
            }
        }
    }
}

/// Identity cache contents. Guarded by the storage service's cache lock.
#[derive(Default)]
pub struct MetricCache {
    by_id: HashMap<i64, Arc<CachedMetric>>,
    by_name: HashMap<String, Arc<CachedMetric>>,

    /// Hostname, as stored in the `metadata` table.
    hostname: String,

    /// Earliest and latest timestamps in the `metric_values` table. Both are
    /// `None` iff the table is empty.
    earliest: Option<DateTime<Utc>>,
    latest: Option<DateTime<Utc>>,
}

impl MetricCache {
    pub fn get_by_id(&self, id: i64) -> Option<Arc<CachedMetric>> {
        self.by_id.get(&id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<CachedMetric>> {
        self.by_name.get(name).cloned()
    }

    pub fn insert(&mut self, metric: Arc<CachedMetric>) {
        self.by_id.insert(metric.id, Arc::clone(&metric));
        self.by_name.insert(metric.name.clone(), metric);
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn earliest(&self) -> Option<DateTime<Utc>> {
        self.earliest
    }

    pub fn latest(&self) -> Option<DateTime<Utc>> {
        self.latest
    }

    /// Widen the cached earliest/latest bounds after a committed push.
    pub fn observe_timestamp(&mut self, timestamp: DateTime<Utc>) {
        if self.earliest.is_none_or(|e| timestamp < e) {
            self.earliest = Some(timestamp);
        }
        if self.latest.is_none_or(|l| timestamp > l) {
            self.latest = Some(timestamp);
        }
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_name.clear();
        self.hostname.clear();
        self.earliest = None;
        self.latest = None;
    }

    /// Rebuild the whole cache from the database.
    pub fn reload(&mut self, conn: &Connection) -> Result<(), StorageError> {
        self.clear();

        let mut stmt =
            conn.prepare("SELECT id, name, flag, format, description, class FROM metrics")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let class_raw: String = row.get(5)?;
            let Some(class) = MetricClass::parse(&class_raw) else {
                tracing::warn!(class = %class_raw, "Skipping metric with unknown class");
                continue;
            };
            self.insert(Arc::new(CachedMetric {
                id: row.get(0)?,
                name: row.get(1)?,
                flag: row.get(2)?,
                format: row.get(3)?,
                description: row.get(4)?,
                class,
            }));
        }

        let (earliest, latest): (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT epoch_us(min(timestamp)), epoch_us(max(timestamp)) \
             FROM metric_values",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        self.earliest = earliest.and_then(DateTime::from_timestamp_micros);
        self.latest = latest.and_then(DateTime::from_timestamp_micros);

        self.hostname = conn.query_row("SELECT hostname FROM metadata LIMIT 1", [], |row| {
            row.get(0)
        })?;

        Ok(())
    }
}
