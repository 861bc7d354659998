//! Versioned SQLite schemas shared by every store in the crate.
//!
//! Each database keeps its schema version in `PRAGMA user_version`, offset by
//! [`BASE_DB_VERSION`] so that a foreign SQLite file is never mistaken for one
//! of ours.

mod versioned_schema;

pub use versioned_schema::*;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use tracing::info;

pub const BASE_DB_VERSION: usize = 7000;

/// Open (or create) a database at `db_path` and bring it to the latest schema.
///
/// New files get the last schema in `schemas`. Existing files are validated
/// against the schema matching their stored version, then migrated forward.
pub fn open_versioned<P: AsRef<Path>>(
    db_path: P,
    schemas: &[VersionedSchema],
    label: &str,
) -> Result<Connection> {
    let db_path = db_path.as_ref();
    let latest = schemas.last().context("No schemas defined")?;

    if !db_path.exists() {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to create {} database at {:?}", label, db_path))?;
        latest.create(&conn)?;
        info!("Created new {} database at {:?}", label, db_path);
        return Ok(conn);
    }

    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed to open {} database at {:?}", label, db_path))?;
    conn.execute("PRAGMA foreign_keys = ON;", [])?;

    let stored: i64 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .context("Failed to read database version")?;
    let version = stored - BASE_DB_VERSION as i64;
    if version < 0 {
        bail!(
            "{} database version {} does not contain base version {}",
            label,
            stored,
            BASE_DB_VERSION
        );
    }
    let version = version as usize;
    if version > latest.version {
        bail!(
            "{} database version {} is too new (max supported: {})",
            label,
            version,
            latest.version
        );
    }

    schemas
        .iter()
        .find(|s| s.version == version)
        .with_context(|| format!("No {} schema for version {}", label, version))?
        .validate(&conn)?;

    for schema in schemas.iter().filter(|s| s.version > version) {
        info!("Migrating {} database to version {}", label, schema.version);
        if let Some(migration) = schema.migration {
            migration(&conn)?;
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + schema.version),
            [],
        )?;
    }

    Ok(conn)
}

/// Open an in-memory database with the latest schema.
pub fn open_in_memory(schemas: &[VersionedSchema]) -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    schemas
        .last()
        .context("No schemas defined")?
        .create(&conn)?;
    Ok(conn)
}

/// Timestamps are stored as fixed-width RFC 3339 text so they sort lexically.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
