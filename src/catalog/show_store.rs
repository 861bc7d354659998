use super::schema::CATALOG_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::{format_datetime, open_in_memory, open_versioned};
use anyhow::{anyhow, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub trait ShowCatalog: Send + Sync {
    fn show_exists(&self, show_id: &str) -> Result<bool>;
}

/// `shows` table in catalog.db.
pub struct SqliteShowCatalog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteShowCatalog {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path, CATALOG_VERSIONED_SCHEMAS, "catalog")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(open_in_memory(CATALOG_VERSIONED_SCHEMAS)?)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("catalog connection lock poisoned"))
    }

    /// Insert or rename a show.
    pub fn add_show(&self, show_id: &str, title: &str, show_date: Option<&str>) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO shows (id, title, show_date, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET title = excluded.title, show_date = excluded.show_date",
            params![show_id, title, show_date, format_datetime(&Utc::now())],
        )?;
        Ok(())
    }

    pub fn count_shows(&self) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM shows", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl ShowCatalog for SqliteShowCatalog {
    fn show_exists(&self, show_id: &str) -> Result<bool> {
        let found = self
            .conn()?
            .query_row("SELECT 1 FROM shows WHERE id = ?1", [show_id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_show_exists() {
        let catalog = SqliteShowCatalog::in_memory().unwrap();
        assert!(!catalog.show_exists("gd1977-05-08").unwrap());

        catalog
            .add_show("gd1977-05-08", "Barton Hall", Some("1977-05-08"))
            .unwrap();
        assert!(catalog.show_exists("gd1977-05-08").unwrap());
        assert_eq!(catalog.count_shows().unwrap(), 1);
    }

    #[test]
    fn test_add_show_is_idempotent() {
        let catalog = SqliteShowCatalog::in_memory().unwrap();
        catalog.add_show("s1", "First", None).unwrap();
        catalog.add_show("s1", "Renamed", None).unwrap();
        assert_eq!(catalog.count_shows().unwrap(), 1);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.db");
        SqliteShowCatalog::new(&path)
            .unwrap()
            .add_show("s1", "First", None)
            .unwrap();

        let reopened = SqliteShowCatalog::new(&path).unwrap();
        assert!(reopened.show_exists("s1").unwrap());
    }
}
