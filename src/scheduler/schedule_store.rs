//! SQLite persistence for schedules and their execution history.

use super::models::*;
use super::schema::SCHEDULER_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::{format_datetime, open_in_memory, open_versioned, parse_datetime};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

pub trait ScheduleStore: Send + Sync {
    // === Schedules ===

    fn insert_schedule(&self, schedule: &Schedule) -> Result<()>;

    /// Persist every stored field. Returns false if the schedule is gone.
    fn update_schedule(&self, schedule: &Schedule) -> Result<bool>;

    fn delete_schedule(&self, id: &str) -> Result<bool>;

    fn get_schedule(&self, id: &str) -> Result<Option<Schedule>>;

    fn list_schedules(&self) -> Result<Vec<Schedule>>;

    // === Executions ===

    /// Append a `running` execution and return its id.
    fn record_execution_start(&self, schedule_id: &str, started_at: DateTime<Utc>) -> Result<i64>;

    /// Move a `running` execution to its final status. An execution is
    /// finished at most once; later calls return false.
    fn record_execution_finish(
        &self,
        execution_id: i64,
        status: ExecutionStatus,
        job_id: Option<&str>,
        error: Option<&str>,
        result: Option<&serde_json::Value>,
        duration_ms: i64,
    ) -> Result<bool>;

    /// Newest first.
    fn get_executions(&self, schedule_id: &str, limit: usize) -> Result<Vec<Execution>>;

    /// Fail every execution still `running`. Called before the evaluation
    /// loop starts, when none of them can still be in flight.
    fn mark_interrupted_executions_failed(&self) -> Result<usize>;

    /// Delete finished executions started before `before`.
    fn prune_executions(&self, before: DateTime<Utc>) -> Result<usize>;
}

pub struct SqliteScheduleStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteScheduleStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path, SCHEDULER_VERSIONED_SCHEMAS, "scheduler")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(open_in_memory(SCHEDULER_VERSIONED_SCHEMAS)?)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("scheduler connection lock poisoned"))
    }

    fn opt_datetime(row: &rusqlite::Row, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
        Ok(row
            .get::<_, Option<String>>(column)?
            .and_then(|s| parse_datetime(&s)))
    }

    fn row_to_schedule(row: &rusqlite::Row) -> rusqlite::Result<Schedule> {
        let id: String = row.get("id")?;
        let schedule_type: String = row.get("schedule_type")?;
        let status: String = row.get("status")?;
        let parameters: String = row.get("parameters")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;

        let schedule_type = ScheduleType::parse(&schedule_type).unwrap_or_else(|| {
            warn!("Schedule {} has unknown type {:?}", id, schedule_type);
            ScheduleType::Custom
        });
        // An unreadable status should never make a schedule fire.
        let status = ScheduleStatus::parse(&status).unwrap_or(ScheduleStatus::Error);

        Ok(Schedule {
            name: row.get("name")?,
            schedule_type,
            cron_expression: row.get("cron_expression")?,
            status,
            parameters: serde_json::from_str(&parameters).unwrap_or(serde_json::Value::Null),
            next_run: Self::opt_datetime(row, "next_run")?,
            last_run: Self::opt_datetime(row, "last_run")?,
            run_count: row.get("run_count")?,
            fail_count: row.get("fail_count")?,
            last_job_id: row.get("last_job_id")?,
            last_status: row
                .get::<_, Option<String>>("last_status")?
                .and_then(|s| ExecutionStatus::parse(&s)),
            last_error: row.get("last_error")?,
            created_at: parse_datetime(&created_at).unwrap_or_else(Utc::now),
            updated_at: parse_datetime(&updated_at).unwrap_or_else(Utc::now),
            is_running: false,
            id,
        })
    }

    fn row_to_execution(row: &rusqlite::Row) -> rusqlite::Result<Execution> {
        let status: String = row.get("status")?;
        let started_at: String = row.get("started_at")?;
        Ok(Execution {
            id: row.get("id")?,
            schedule_id: row.get("schedule_id")?,
            job_id: row.get("job_id")?,
            status: ExecutionStatus::parse(&status).unwrap_or(ExecutionStatus::Failed),
            started_at: parse_datetime(&started_at).unwrap_or_else(Utc::now),
            completed_at: Self::opt_datetime(row, "completed_at")?,
            duration_ms: row.get("duration_ms")?,
            error: row.get("error")?,
            result: row
                .get::<_, Option<String>>("result")?
                .and_then(|s| serde_json::from_str(&s).ok()),
        })
    }
}

impl ScheduleStore for SqliteScheduleStore {
    fn insert_schedule(&self, s: &Schedule) -> Result<()> {
        self.conn()?.execute(
            r#"INSERT INTO schedules (
                id, name, schedule_type, cron_expression, status, parameters,
                next_run, last_run, run_count, fail_count, last_job_id, last_status,
                last_error, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"#,
            params![
                s.id,
                s.name,
                s.schedule_type.as_str(),
                s.cron_expression,
                s.status.as_str(),
                s.parameters.to_string(),
                s.next_run.as_ref().map(format_datetime),
                s.last_run.as_ref().map(format_datetime),
                s.run_count,
                s.fail_count,
                s.last_job_id,
                s.last_status.map(|st| st.as_str()),
                s.last_error,
                format_datetime(&s.created_at),
                format_datetime(&s.updated_at),
            ],
        )?;
        Ok(())
    }

    fn update_schedule(&self, s: &Schedule) -> Result<bool> {
        let updated = self.conn()?.execute(
            r#"UPDATE schedules SET
                name = ?2, schedule_type = ?3, cron_expression = ?4, status = ?5,
                parameters = ?6, next_run = ?7, last_run = ?8, run_count = ?9,
                fail_count = ?10, last_job_id = ?11, last_status = ?12, last_error = ?13,
                updated_at = ?14
            WHERE id = ?1"#,
            params![
                s.id,
                s.name,
                s.schedule_type.as_str(),
                s.cron_expression,
                s.status.as_str(),
                s.parameters.to_string(),
                s.next_run.as_ref().map(format_datetime),
                s.last_run.as_ref().map(format_datetime),
                s.run_count,
                s.fail_count,
                s.last_job_id,
                s.last_status.map(|st| st.as_str()),
                s.last_error,
                format_datetime(&s.updated_at),
            ],
        )?;
        Ok(updated == 1)
    }

    fn delete_schedule(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        let deleted = conn.execute("DELETE FROM schedules WHERE id = ?1", [id])?;
        Ok(deleted == 1)
    }

    fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        let schedule = self
            .conn()?
            .query_row(
                "SELECT * FROM schedules WHERE id = ?1",
                [id],
                Self::row_to_schedule,
            )
            .optional()?;
        Ok(schedule)
    }

    fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM schedules ORDER BY created_at ASC")?;
        let schedules = stmt
            .query_map([], Self::row_to_schedule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(schedules)
    }

    fn record_execution_start(&self, schedule_id: &str, started_at: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO schedule_executions (schedule_id, status, started_at) VALUES (?1, 'running', ?2)",
            params![schedule_id, format_datetime(&started_at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn record_execution_finish(
        &self,
        execution_id: i64,
        status: ExecutionStatus,
        job_id: Option<&str>,
        error: Option<&str>,
        result: Option<&serde_json::Value>,
        duration_ms: i64,
    ) -> Result<bool> {
        let updated = self.conn()?.execute(
            r#"UPDATE schedule_executions
               SET status = ?2, job_id = ?3, error = ?4, result = ?5,
                   duration_ms = ?6, completed_at = ?7
               WHERE id = ?1 AND status = 'running'"#,
            params![
                execution_id,
                status.as_str(),
                job_id,
                error,
                result.map(|r| r.to_string()),
                duration_ms,
                format_datetime(&Utc::now()),
            ],
        )?;
        Ok(updated == 1)
    }

    fn get_executions(&self, schedule_id: &str, limit: usize) -> Result<Vec<Execution>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM schedule_executions
             WHERE schedule_id = ?1
             ORDER BY started_at DESC, id DESC
             LIMIT ?2",
        )?;
        let executions = stmt
            .query_map(params![schedule_id, limit as i64], Self::row_to_execution)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(executions)
    }

    fn mark_interrupted_executions_failed(&self) -> Result<usize> {
        let updated = self.conn()?.execute(
            "UPDATE schedule_executions
             SET status = 'failed', error = 'Interrupted (process restart)', completed_at = ?1
             WHERE status = 'running'",
            [format_datetime(&Utc::now())],
        )?;
        Ok(updated)
    }

    fn prune_executions(&self, before: DateTime<Utc>) -> Result<usize> {
        let deleted = self.conn()?.execute(
            "DELETE FROM schedule_executions WHERE status != 'running' AND started_at < ?1",
            [format_datetime(&before)],
        )?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn schedule(id: &str) -> Schedule {
        let now = Utc::now();
        Schedule {
            id: id.to_string(),
            name: format!("schedule {}", id),
            schedule_type: ScheduleType::HealthCheck,
            cron_expression: "0 * * * *".to_string(),
            status: ScheduleStatus::Active,
            parameters: serde_json::json!({"verbose": true}),
            next_run: Some(now + Duration::hours(1)),
            last_run: None,
            run_count: 0,
            fail_count: 0,
            last_job_id: None,
            last_status: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            is_running: false,
        }
    }

    #[test]
    fn test_insert_get_update_delete() {
        let store = SqliteScheduleStore::in_memory().unwrap();
        let mut s = schedule("a");
        store.insert_schedule(&s).unwrap();

        let loaded = store.get_schedule("a").unwrap().unwrap();
        assert_eq!(loaded.name, s.name);
        assert_eq!(loaded.parameters, s.parameters);
        assert_eq!(
            loaded.next_run.unwrap().timestamp_millis(),
            s.next_run.unwrap().timestamp_millis()
        );

        s.run_count = 3;
        s.status = ScheduleStatus::Paused;
        s.last_status = Some(ExecutionStatus::Failed);
        assert!(store.update_schedule(&s).unwrap());
        let loaded = store.get_schedule("a").unwrap().unwrap();
        assert_eq!(loaded.run_count, 3);
        assert_eq!(loaded.status, ScheduleStatus::Paused);
        assert_eq!(loaded.last_status, Some(ExecutionStatus::Failed));

        assert!(store.delete_schedule("a").unwrap());
        assert!(store.get_schedule("a").unwrap().is_none());
        assert!(!store.update_schedule(&s).unwrap());
    }

    #[test]
    fn test_runtime_fields_not_persisted() {
        let store = SqliteScheduleStore::in_memory().unwrap();
        let mut s = schedule("a");
        s.is_running = true;
        store.insert_schedule(&s).unwrap();

        let loaded = store.get_schedule("a").unwrap().unwrap();
        assert!(!loaded.is_running);
    }

    #[test]
    fn test_execution_lifecycle() {
        let store = SqliteScheduleStore::in_memory().unwrap();
        store.insert_schedule(&schedule("a")).unwrap();

        let id = store.record_execution_start("a", Utc::now()).unwrap();
        let running = &store.get_executions("a", 10).unwrap()[0];
        assert_eq!(running.status, ExecutionStatus::Running);
        assert!(running.completed_at.is_none());

        let result = serde_json::json!({"ok": true});
        assert!(store
            .record_execution_finish(id, ExecutionStatus::Completed, Some("job-1"), None, Some(&result), 42)
            .unwrap());
        // Finished executions are immutable.
        assert!(!store
            .record_execution_finish(id, ExecutionStatus::Failed, None, Some("late"), None, 1)
            .unwrap());

        let done = &store.get_executions("a", 10).unwrap()[0];
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.job_id.as_deref(), Some("job-1"));
        assert_eq!(done.duration_ms, Some(42));
        assert_eq!(done.result, Some(result));
        assert!(done.error.is_none());
    }

    #[test]
    fn test_executions_newest_first_and_limited() {
        let store = SqliteScheduleStore::in_memory().unwrap();
        store.insert_schedule(&schedule("a")).unwrap();
        let base = Utc::now();
        for i in 0..3 {
            store
                .record_execution_start("a", base + Duration::seconds(i))
                .unwrap();
        }
        let executions = store.get_executions("a", 2).unwrap();
        assert_eq!(executions.len(), 2);
        assert!(executions[0].started_at > executions[1].started_at);
    }

    #[test]
    fn test_mark_interrupted_executions_failed() {
        let store = SqliteScheduleStore::in_memory().unwrap();
        store.insert_schedule(&schedule("a")).unwrap();
        let finished = store.record_execution_start("a", Utc::now()).unwrap();
        store
            .record_execution_finish(finished, ExecutionStatus::Completed, None, None, None, 5)
            .unwrap();
        store.record_execution_start("a", Utc::now()).unwrap();

        assert_eq!(store.mark_interrupted_executions_failed().unwrap(), 1);
        let executions = store.get_executions("a", 10).unwrap();
        assert!(executions
            .iter()
            .all(|e| e.status != ExecutionStatus::Running));
        assert!(executions
            .iter()
            .any(|e| e.error.as_deref() == Some("Interrupted (process restart)")));
    }

    #[test]
    fn test_prune_executions_keeps_running() {
        let store = SqliteScheduleStore::in_memory().unwrap();
        store.insert_schedule(&schedule("a")).unwrap();
        let old = Utc::now() - Duration::days(40);
        let done = store.record_execution_start("a", old).unwrap();
        store
            .record_execution_finish(done, ExecutionStatus::Failed, None, Some("x"), None, 5)
            .unwrap();
        store.record_execution_start("a", old).unwrap();
        store.record_execution_start("a", Utc::now()).unwrap();

        let pruned = store
            .prune_executions(Utc::now() - Duration::days(30))
            .unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.get_executions("a", 10).unwrap().len(), 2);
    }

    #[test]
    fn test_delete_cascades_to_executions() {
        let dir = TempDir::new().unwrap();
        let store = SqliteScheduleStore::new(dir.path().join("scheduler.db")).unwrap();
        store.insert_schedule(&schedule("a")).unwrap();
        store.record_execution_start("a", Utc::now()).unwrap();

        store.delete_schedule("a").unwrap();
        assert!(store.get_executions("a", 10).unwrap().is_empty());
    }
}
