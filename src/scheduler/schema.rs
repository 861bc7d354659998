//! Database schema for scheduler.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema,
};

const SCHEDULES_TABLE_V0: Table = Table {
    name: "schedules",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("schedule_type", &SqlType::Text, non_null = true),
        sqlite_column!("cron_expression", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("parameters", &SqlType::Text, non_null = true, default_value = Some("'{}'")),
        sqlite_column!("next_run", &SqlType::Text),
        sqlite_column!("last_run", &SqlType::Text),
        sqlite_column!("run_count", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("fail_count", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("last_job_id", &SqlType::Text),
        sqlite_column!("last_status", &SqlType::Text),
        sqlite_column!("last_error", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
        sqlite_column!("updated_at", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_schedules_status_next_run", "status, next_run")],
};

const SCHEDULE_EXECUTIONS_TABLE_V0: Table = Table {
    name: "schedule_executions",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "schedule_id",
            &SqlType::Text,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "schedules",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("job_id", &SqlType::Text),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("started_at", &SqlType::Text, non_null = true),
        sqlite_column!("completed_at", &SqlType::Text),
        sqlite_column!("duration_ms", &SqlType::Integer),
        sqlite_column!("error", &SqlType::Text),
        sqlite_column!("result", &SqlType::Text),
    ],
    indices: &[
        ("idx_executions_schedule", "schedule_id, started_at"),
        ("idx_executions_status", "status"),
    ],
};

pub const SCHEDULER_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[SCHEDULES_TABLE_V0, SCHEDULE_EXECUTIONS_TABLE_V0],
    migration: None,
}];
