//! SQLite persistence for download records.

use super::models::*;
use super::schema::DOWNLOADS_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::{format_datetime, open_in_memory, open_versioned, parse_datetime};
use anyhow::{anyhow, Context, Result};
use chrono::{SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

const NON_TERMINAL: &str = "('pending', 'queued', 'in_progress')";

/// Storage operations for download records.
///
/// Every state transition is conditional on the current status, so a record
/// that reached a terminal status is never overwritten.
pub trait DownloadStore: Send + Sync {
    // === Queue Management ===

    /// Persist a new `queued` record at the tail of the queue, unless a
    /// non-terminal record already exists for the same triple.
    fn enqueue(&self, record: DownloadRecord) -> Result<EnqueueOutcome>;

    fn get(&self, id: &str) -> Result<Option<DownloadRecord>>;

    /// List records, newest first, optionally filtered by status.
    fn list(
        &self,
        status: Option<DownloadStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DownloadRecord>>;

    /// Up to `limit` queued records in ascending queue position.
    fn list_queued(&self, limit: usize) -> Result<Vec<DownloadRecord>>;

    /// 1-based rank among queued records.
    fn queue_position(&self, id: &str) -> Result<Option<usize>>;

    // === State Transitions (atomic) ===

    /// `queued -> in_progress`. Returns false if the record is no longer queued.
    fn claim(&self, id: &str, job_id: &str) -> Result<bool>;

    /// `in_progress -> completed`.
    fn mark_completed(&self, id: &str, file_path: &str, file_size: i64) -> Result<bool>;

    /// `in_progress -> failed`.
    fn mark_failed(&self, id: &str, error: &str) -> Result<bool>;

    /// Any non-terminal status `-> cancelled`.
    fn mark_cancelled(&self, id: &str) -> Result<bool>;

    /// Fail every `in_progress` record. Used at startup, when no download can
    /// still be running.
    fn fail_interrupted(&self) -> Result<usize>;

    // === Statistics ===

    fn stats(&self) -> Result<DownloadStats>;
}

pub struct SqliteDownloadStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDownloadStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path, DOWNLOADS_VERSIONED_SCHEMAS, "downloads")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(open_in_memory(DOWNLOADS_VERSIONED_SCHEMAS)?)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("downloads connection lock poisoned"))
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<DownloadRecord> {
        let id: String = row.get("id")?;
        let status: String = row.get("status")?;
        let format: String = row.get("format")?;
        let quality: String = row.get("quality")?;
        let created_at: String = row.get("created_at")?;

        Ok(DownloadRecord {
            status: DownloadStatus::parse(&status).unwrap_or_else(|| {
                warn!("Download {} has unknown status {:?}", id, status);
                DownloadStatus::Failed
            }),
            format: DownloadFormat::parse(&format).unwrap_or(DownloadFormat::Mp3),
            quality: DownloadQuality::parse(&quality).unwrap_or_default(),
            show_id: row.get("show_id")?,
            priority: row.get("priority")?,
            queue_position: row.get("queue_position")?,
            job_id: row.get("job_id")?,
            file_path: row.get("file_path")?,
            file_size: row.get("file_size")?,
            error_message: row.get("error_message")?,
            created_at: parse_datetime(&created_at).unwrap_or_else(Utc::now),
            started_at: row
                .get::<_, Option<String>>("started_at")?
                .and_then(|s| parse_datetime(&s)),
            completed_at: row
                .get::<_, Option<String>>("completed_at")?
                .and_then(|s| parse_datetime(&s)),
            id,
        })
    }

    fn count_grouped(conn: &Connection, column: &str) -> Result<BTreeMap<String, usize>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {column}, COUNT(*) FROM downloads GROUP BY {column}"
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
        Ok(rows)
    }
}

impl DownloadStore for SqliteDownloadStore {
    fn enqueue(&self, mut record: DownloadRecord) -> Result<EnqueueOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                &format!(
                    "SELECT id FROM downloads
                     WHERE show_id = ?1 AND format = ?2 AND quality = ?3 AND status IN {NON_TERMINAL}
                     LIMIT 1"
                ),
                params![
                    record.show_id,
                    record.format.as_str(),
                    record.quality.as_str()
                ],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing_id) = existing {
            return Ok(EnqueueOutcome::Duplicate { existing_id });
        }

        let position: i64 = tx.query_row(
            "SELECT COALESCE(MAX(queue_position), 0) + 1 FROM downloads",
            [],
            |row| row.get(0),
        )?;
        record.status = DownloadStatus::Queued;
        record.queue_position = Some(position);
        // Stored with millisecond precision; keep the returned record identical.
        record.created_at = record.created_at.trunc_subsecs(3);

        tx.execute(
            r#"INSERT INTO downloads (
                id, show_id, format, quality, priority, status, queue_position,
                job_id, file_path, file_size, error_message,
                created_at, started_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, NULL, NULL, ?8, NULL, NULL)"#,
            params![
                record.id,
                record.show_id,
                record.format.as_str(),
                record.quality.as_str(),
                record.priority,
                record.status.as_str(),
                position,
                format_datetime(&record.created_at),
            ],
        )?;
        tx.commit().context("Failed to commit enqueue")?;

        Ok(EnqueueOutcome::Queued(record))
    }

    fn get(&self, id: &str) -> Result<Option<DownloadRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT * FROM downloads WHERE id = ?1",
                [id],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn list(
        &self,
        status: Option<DownloadStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DownloadRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM downloads
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY created_at DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let records = stmt
            .query_map(
                params![status.map(|s| s.as_str()), limit as i64, offset as i64],
                Self::row_to_record,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn list_queued(&self, limit: usize) -> Result<Vec<DownloadRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM downloads
             WHERE status = 'queued'
             ORDER BY queue_position ASC
             LIMIT ?1",
        )?;
        let records = stmt
            .query_map([limit as i64], Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn queue_position(&self, id: &str) -> Result<Option<usize>> {
        let conn = self.conn()?;
        let position: Option<i64> = conn
            .query_row(
                "SELECT queue_position FROM downloads WHERE id = ?1 AND status = 'queued'",
                [id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        let Some(position) = position else {
            return Ok(None);
        };
        let ahead: i64 = conn.query_row(
            "SELECT COUNT(*) FROM downloads WHERE status = 'queued' AND queue_position < ?1",
            [position],
            |row| row.get(0),
        )?;
        Ok(Some(ahead as usize + 1))
    }

    fn claim(&self, id: &str, job_id: &str) -> Result<bool> {
        let updated = self.conn()?.execute(
            "UPDATE downloads
             SET status = 'in_progress', job_id = ?2, started_at = ?3, queue_position = NULL
             WHERE id = ?1 AND status = 'queued'",
            params![id, job_id, format_datetime(&Utc::now())],
        )?;
        Ok(updated == 1)
    }

    fn mark_completed(&self, id: &str, file_path: &str, file_size: i64) -> Result<bool> {
        let updated = self.conn()?.execute(
            "UPDATE downloads
             SET status = 'completed', file_path = ?2, file_size = ?3, completed_at = ?4,
                 queue_position = NULL, error_message = NULL
             WHERE id = ?1 AND status = 'in_progress'",
            params![id, file_path, file_size, format_datetime(&Utc::now())],
        )?;
        Ok(updated == 1)
    }

    fn mark_failed(&self, id: &str, error: &str) -> Result<bool> {
        let updated = self.conn()?.execute(
            "UPDATE downloads
             SET status = 'failed', error_message = ?2, completed_at = ?3, queue_position = NULL
             WHERE id = ?1 AND status = 'in_progress'",
            params![id, error, format_datetime(&Utc::now())],
        )?;
        Ok(updated == 1)
    }

    fn mark_cancelled(&self, id: &str) -> Result<bool> {
        let updated = self.conn()?.execute(
            &format!(
                "UPDATE downloads
                 SET status = 'cancelled', completed_at = ?2, queue_position = NULL
                 WHERE id = ?1 AND status IN {NON_TERMINAL}"
            ),
            params![id, format_datetime(&Utc::now())],
        )?;
        Ok(updated == 1)
    }

    fn fail_interrupted(&self) -> Result<usize> {
        let updated = self.conn()?.execute(
            "UPDATE downloads
             SET status = 'failed', error_message = 'Interrupted by restart',
                 completed_at = ?1, queue_position = NULL
             WHERE status = 'in_progress'",
            [format_datetime(&Utc::now())],
        )?;
        Ok(updated)
    }

    fn stats(&self) -> Result<DownloadStats> {
        let conn = self.conn()?;
        let by_status = Self::count_grouped(&conn, "status")?;
        let queue_length = by_status.get("queued").copied().unwrap_or(0);
        Ok(DownloadStats {
            queue_length,
            by_status,
            by_format: Self::count_grouped(&conn, "format")?,
            by_quality: Self::count_grouped(&conn, "quality")?,
            active_count: 0,
            max_concurrent: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn request(show_id: &str) -> DownloadRequest {
        DownloadRequest {
            show_id: show_id.to_string(),
            format: DownloadFormat::Flac,
            quality: None,
            priority: None,
        }
    }

    fn enqueue(store: &SqliteDownloadStore, show_id: &str) -> DownloadRecord {
        match store.enqueue(DownloadRecord::new(&request(show_id))).unwrap() {
            EnqueueOutcome::Queued(record) => record,
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_enqueue_assigns_increasing_positions() {
        let store = SqliteDownloadStore::in_memory().unwrap();
        let a = enqueue(&store, "a");
        let b = enqueue(&store, "b");
        assert_eq!(a.queue_position, Some(1));
        assert_eq!(b.queue_position, Some(2));

        let stored = store.get(&b.id).unwrap().unwrap();
        assert_eq!(stored, b);
    }

    #[test]
    fn test_enqueued_record_matches_stored_row() {
        let store = SqliteDownloadStore::in_memory().unwrap();
        let mut record = DownloadRecord::new(&request("a"));
        record.created_at = Utc.with_ymd_and_hms(2024, 5, 8, 21, 30, 0).unwrap()
            + chrono::Duration::nanoseconds(14_956_755);

        let queued = match store.enqueue(record).unwrap() {
            EnqueueOutcome::Queued(record) => record,
            other => panic!("expected queued, got {:?}", other),
        };
        assert_eq!(queued.created_at.timestamp_subsec_nanos(), 14_000_000);
        assert_eq!(store.get(&queued.id).unwrap().unwrap(), queued);
    }

    #[test]
    fn test_enqueue_rejects_active_duplicate() {
        let store = SqliteDownloadStore::in_memory().unwrap();
        let first = enqueue(&store, "a");

        match store.enqueue(DownloadRecord::new(&request("a"))).unwrap() {
            EnqueueOutcome::Duplicate { existing_id } => assert_eq!(existing_id, first.id),
            other => panic!("expected duplicate, got {:?}", other),
        }

        // Another quality is a different triple.
        let mut hd = request("a");
        hd.quality = Some(DownloadQuality::Hd);
        assert!(matches!(
            store.enqueue(DownloadRecord::new(&hd)).unwrap(),
            EnqueueOutcome::Queued(_)
        ));
    }

    #[test]
    fn test_enqueue_allows_requeue_after_terminal() {
        let store = SqliteDownloadStore::in_memory().unwrap();
        let first = enqueue(&store, "a");
        assert!(store.mark_cancelled(&first.id).unwrap());
        let second = enqueue(&store, "a");
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_list_queued_orders_by_position() {
        let store = SqliteDownloadStore::in_memory().unwrap();
        let ids: Vec<String> = ["a", "b", "c"].iter().map(|s| enqueue(&store, s).id).collect();

        let queued = store.list_queued(2).unwrap();
        assert_eq!(
            queued.iter().map(|r| r.id.clone()).collect::<Vec<_>>(),
            ids[..2].to_vec()
        );
    }

    #[test]
    fn test_claim_is_conditional() {
        let store = SqliteDownloadStore::in_memory().unwrap();
        let record = enqueue(&store, "a");

        assert!(store.claim(&record.id, "job-1").unwrap());
        assert!(!store.claim(&record.id, "job-2").unwrap());

        let stored = store.get(&record.id).unwrap().unwrap();
        assert_eq!(stored.status, DownloadStatus::InProgress);
        assert_eq!(stored.job_id.as_deref(), Some("job-1"));
        assert!(stored.queue_position.is_none());
        assert!(stored.started_at.is_some());
    }

    #[test]
    fn test_terminal_states_are_not_overwritten() {
        let store = SqliteDownloadStore::in_memory().unwrap();
        let record = enqueue(&store, "a");
        store.claim(&record.id, "job-1").unwrap();

        assert!(store.mark_cancelled(&record.id).unwrap());
        assert!(!store.mark_completed(&record.id, "/tmp/x.flac", 10).unwrap());
        assert!(!store.mark_failed(&record.id, "late").unwrap());
        assert!(!store.mark_cancelled(&record.id).unwrap());

        let stored = store.get(&record.id).unwrap().unwrap();
        assert_eq!(stored.status, DownloadStatus::Cancelled);
        assert!(stored.file_path.is_none());
    }

    #[test]
    fn test_mark_completed_records_file() {
        let store = SqliteDownloadStore::in_memory().unwrap();
        let record = enqueue(&store, "a");
        store.claim(&record.id, "job-1").unwrap();
        assert!(store.mark_completed(&record.id, "/music/a.flac", 4096).unwrap());

        let stored = store.get(&record.id).unwrap().unwrap();
        assert_eq!(stored.status, DownloadStatus::Completed);
        assert_eq!(stored.file_path.as_deref(), Some("/music/a.flac"));
        assert_eq!(stored.file_size, Some(4096));
        assert!(stored.completed_at.is_some());
    }

    #[test]
    fn test_queue_position_rank() {
        let store = SqliteDownloadStore::in_memory().unwrap();
        let a = enqueue(&store, "a");
        let b = enqueue(&store, "b");
        let c = enqueue(&store, "c");

        assert_eq!(store.queue_position(&c.id).unwrap(), Some(3));
        store.claim(&a.id, "job").unwrap();
        store.mark_cancelled(&b.id).unwrap();
        assert_eq!(store.queue_position(&c.id).unwrap(), Some(1));
        assert_eq!(store.queue_position(&a.id).unwrap(), None);
    }

    #[test]
    fn test_fail_interrupted() {
        let store = SqliteDownloadStore::in_memory().unwrap();
        let a = enqueue(&store, "a");
        let b = enqueue(&store, "b");
        store.claim(&a.id, "job").unwrap();

        assert_eq!(store.fail_interrupted().unwrap(), 1);
        let a = store.get(&a.id).unwrap().unwrap();
        assert_eq!(a.status, DownloadStatus::Failed);
        assert_eq!(a.error_message.as_deref(), Some("Interrupted by restart"));
        assert_eq!(
            store.get(&b.id).unwrap().unwrap().status,
            DownloadStatus::Queued
        );
    }

    #[test]
    fn test_stats_and_list() {
        let store = SqliteDownloadStore::in_memory().unwrap();
        let a = enqueue(&store, "a");
        enqueue(&store, "b");
        let mut mp3 = request("c");
        mp3.format = DownloadFormat::Mp3;
        store.enqueue(DownloadRecord::new(&mp3)).unwrap();
        store.claim(&a.id, "job").unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.queue_length, 2);
        assert_eq!(stats.by_status.get("in_progress"), Some(&1));
        assert_eq!(stats.by_format.get("flac"), Some(&2));
        assert_eq!(stats.by_format.get("mp3"), Some(&1));
        assert_eq!(stats.by_quality.get("standard"), Some(&3));

        assert_eq!(store.list(None, 10, 0).unwrap().len(), 3);
        assert_eq!(
            store
                .list(Some(DownloadStatus::InProgress), 10, 0)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("downloads.db");
        let id = {
            let store = SqliteDownloadStore::new(&path).unwrap();
            enqueue(&store, "a").id
        };
        let store = SqliteDownloadStore::new(&path).unwrap();
        assert!(store.get(&id).unwrap().is_some());
        assert_eq!(enqueue(&store, "b").queue_position, Some(2));
    }
}
