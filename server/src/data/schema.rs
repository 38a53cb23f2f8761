//! Database schema definition
//!
//! Sample values use a discriminated UNION column: counters are stored as
//! float64 rates, everything else as raw uint64. The arm in use is fixed per
//! metric by its `class` column.

/// Current schema version
pub const SCHEMA_VERSION: i64 = 1;

/// Complete schema SQL. Creation is idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS metadata (
    app_version VARCHAR NOT NULL,
    app_revision VARCHAR NOT NULL,
    schema_version INTEGER NOT NULL,
    hostname VARCHAR NOT NULL
);

CREATE SEQUENCE IF NOT EXISTS metrics_seq;

CREATE TABLE IF NOT EXISTS metrics (
    id INTEGER PRIMARY KEY,
    name VARCHAR NOT NULL,
    flag VARCHAR NOT NULL,
    format VARCHAR NOT NULL,
    description VARCHAR NOT NULL,
    class VARCHAR NOT NULL,
    UNIQUE(name)
);

CREATE TABLE IF NOT EXISTS metric_values (
    metric_id INTEGER NOT NULL REFERENCES metrics(id),
    timestamp TIMESTAMP NOT NULL,
    value UNION(float64 FLOAT8, uint64 UBIGINT) NOT NULL,
    PRIMARY KEY (metric_id, timestamp)
);
"#;
