//! Schema initialization and migrations
//!
//! Table creation is idempotent. The `metadata` row tracks the schema
//! version; databases written by a newer application are rejected.

use duckdb::{Connection, params};

use crate::core::constants::{APP_REVISION, APP_VERSION};

use super::error::StorageError;
use super::schema::{SCHEMA, SCHEMA_VERSION};

/// Create tables if missing, seed metadata, and apply pending migrations.
pub fn run(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(SCHEMA)?;

    let count: i64 = conn.query_row("SELECT COUNT(*) FROM metadata", [], |row| row.get(0))?;
    if count == 0 {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        conn.execute(
            "INSERT INTO metadata (app_version, app_revision, schema_version, hostname) \
             VALUES (?, ?, ?, ?)",
            params![APP_VERSION, APP_REVISION, SCHEMA_VERSION, hostname],
        )?;
        tracing::debug!(version = SCHEMA_VERSION, "Initialized database schema");
        return Ok(());
    }

    let current: i64 =
        conn.query_row("SELECT schema_version FROM metadata LIMIT 1", [], |row| {
            row.get(0)
        })?;

    if current > SCHEMA_VERSION {
        return Err(StorageError::SchemaTooNew {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }

    for version in (current + 1)..=SCHEMA_VERSION {
        tracing::debug!(version, "Applying migration");
        apply_migration(conn, version)?;
        conn.execute(
            "UPDATE metadata SET schema_version = ?, app_version = ?, app_revision = ?",
            params![version, APP_VERSION, APP_REVISION],
        )?;
    }

    Ok(())
}

fn apply_migration(_conn: &Connection, version: i64) -> Result<(), StorageError> {
    // Future schema changes go here, keyed by target version.
    match version {
        1 => Ok(()), // Covered by the initial schema.
        _ => Err(StorageError::MigrationFailed {
            version,
            error: "unknown migration version".to_string(),
        }),
    }
}
