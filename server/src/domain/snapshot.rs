//! Stats snapshot parsing
//!
//! Decodes the JSON emitted by the stats subprocess into a typed snapshot.
//! Two shapes exist: newer outputs carry a `version` field and nest the
//! records under `counters`; legacy outputs mix the records with a
//! `timestamp` key at the top level.
//!
//! The snapshot timestamp is the wall-clock instant at parse time. The
//! subprocess-provided timestamp string carries no timezone information and
//! would be misread as UTC, so it is deliberately ignored.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid stats payload: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("invalid '{field}' field: {source}")]
    InvalidField {
        field: &'static str,
        source: serde_json::Error,
    },

    #[error("missing 'counters' field")]
    MissingCounters,

    #[error("invalid metric record '{name}': {source}")]
    InvalidRecord {
        name: String,
        source: serde_json::Error,
    },
}

/// One complete dump from the stats subprocess.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub version: i64,
    pub timestamp: DateTime<Utc>,
    pub items: HashMap<String, MetricRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricRecord {
    pub description: String,
    pub flag: String,
    pub format: String,
    pub value: u64,
}

impl MetricRecord {
    pub fn is_counter(&self) -> bool {
        self.flag == "c"
    }

    pub fn is_bitmap(&self) -> bool {
        self.flag == "b"
    }

    pub fn has_duration_format(&self) -> bool {
        self.format == "d"
    }
}

/// Parse raw subprocess output into a snapshot.
pub fn parse_snapshot(input: &[u8]) -> Result<StatsSnapshot, ParseError> {
    let raw: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(input).map_err(ParseError::InvalidJson)?;

    let version = match raw.get("version") {
        Some(value) => {
            i64::deserialize(value).map_err(|e| ParseError::InvalidField {
                field: "version",
                source: e,
            })?
        }
        None => 0,
    };

    let mut items = HashMap::new();
    if version > 0 {
        // Records live inside the 'counters' object; the top-level timestamp
        // is ignored either way.
        let counters = raw.get("counters").ok_or(ParseError::MissingCounters)?;
        let counters = counters
            .as_object()
            .ok_or(ParseError::MissingCounters)?;
        for (name, value) in counters {
            let record =
                MetricRecord::deserialize(value).map_err(|e| ParseError::InvalidRecord {
                    name: name.clone(),
                    source: e,
                })?;
            items.insert(name.clone(), record);
        }
    } else {
        // Legacy shape: every top-level key except 'timestamp' is a record.
        for (name, value) in &raw {
            if name == "timestamp" {
                continue;
            }
            let record =
                MetricRecord::deserialize(value).map_err(|e| ParseError::InvalidRecord {
                    name: name.clone(),
                    source: e,
                })?;
            items.insert(name.clone(), record);
        }
    }

    Ok(StatsSnapshot {
        version,
        timestamp: Utc::now(),
        items,
    })
}
