//! Database schema for downloads.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

const DOWNLOADS_TABLE_V0: Table = Table {
    name: "downloads",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("show_id", &SqlType::Text, non_null = true),
        sqlite_column!("format", &SqlType::Text, non_null = true),
        sqlite_column!("quality", &SqlType::Text, non_null = true),
        sqlite_column!("priority", &SqlType::Integer, non_null = true, default_value = Some("5")),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("queue_position", &SqlType::Integer),
        sqlite_column!("job_id", &SqlType::Text),
        sqlite_column!("file_path", &SqlType::Text),
        sqlite_column!("file_size", &SqlType::Integer),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
        sqlite_column!("started_at", &SqlType::Text),
        sqlite_column!("completed_at", &SqlType::Text),
    ],
    indices: &[
        ("idx_downloads_status_position", "status, queue_position"),
        ("idx_downloads_triple", "show_id, format, quality"),
    ],
};

pub const DOWNLOADS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[DOWNLOADS_TABLE_V0],
    migration: None,
}];
