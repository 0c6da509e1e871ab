//! SQLite-backed control-plane state (users, sessions).

mod schema;

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

/// Error type for control DB operations.
#[derive(Debug, thiserror::Error)]
pub enum ControlDbError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ControlDbError>;

pub struct ControlDb {
    conn: Mutex<Connection>,
}

impl ControlDb {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(schema::CREATE_TABLES)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(schema::CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn schema_version(&self) -> Result<Option<String>> {
        let conn = self.lock_conn();
        let mut stmt =
            conn.prepare("SELECT value FROM control_metadata WHERE key = 'schema_version'")?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}

/// Fixed-width UTC timestamp so stored values compare lexicographically.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_db_has_schema_version() {
        let db = ControlDb::in_memory().unwrap();
        assert_eq!(db.schema_version().unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let a = DateTime::parse_from_rfc3339("2024-01-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let b = a + chrono::Duration::milliseconds(1500);
        assert!(format_ts(a) < format_ts(b));
        assert_eq!(parse_ts(&format_ts(b)), Some(b));
    }

    #[test]
    fn file_db_creates_parent_dirs() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let path = dir.path().join("nested").join("control.db");
        let db = ControlDb::new(&path).unwrap();
        assert!(path.exists());
        assert_eq!(db.schema_version().unwrap().as_deref(), Some("1"));
    }
}
