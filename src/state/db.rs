// SQLite database setup and migrations
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use super::storage::{get_app_data_dir, StorageError};

const DB_FILENAME: &str = "fallwatch.db";

// Writers wait this long on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Corrupt row in {table}: {message}")]
    CorruptRow { table: &'static str, message: String },
}

pub type DbResult<T> = Result<T, DbError>;

// Thread-safe database connection wrapper
#[derive(Clone)]
pub struct DbConnection {
    conn: Arc<Mutex<Connection>>,
}

impl DbConnection {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// A panicked writer leaves SQLite consistent, so a poisoned lock is reused
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Open the database at `path`, or `fallwatch.db` in the app data directory
pub fn init_db(path: Option<&Path>) -> DbResult<DbConnection> {
    let db_path = match path {
        Some(p) => p.to_path_buf(),
        None => get_app_data_dir()?.join(DB_FILENAME),
    };

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(&db_path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    run_migrations(&conn)?;

    log::info!("Database ready at {}", db_path.display());
    Ok(DbConnection::new(conn))
}

/// In-memory database with the full schema
pub fn open_in_memory() -> DbResult<DbConnection> {
    let conn = Connection::open_in_memory()?;
    run_migrations(&conn)?;
    Ok(DbConnection::new(conn))
}

fn run_migrations(conn: &Connection) -> DbResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current_version < 1 {
        migration_v1(conn)?;
        conn.execute("INSERT INTO schema_migrations (version) VALUES (?1)", [1])?;
    }

    Ok(())
}

fn migration_v1(conn: &Connection) -> DbResult<()> {
    // One row per alerted window
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fall_events (
            id TEXT PRIMARY KEY,
            window_id TEXT NOT NULL UNIQUE,
            device_id TEXT NOT NULL,
            label TEXT NOT NULL,
            class_index INTEGER NOT NULL,
            confidence REAL NOT NULL,
            occurred_at TEXT NOT NULL,
            delivered INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fall_events_occurred_at ON fall_events(occurred_at DESC)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fall_events_device_id ON fall_events(device_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS dataset_files (
            id TEXT PRIMARY KEY,
            device_id TEXT NOT NULL,
            label INTEGER NOT NULL,
            path TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            records INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_dataset_files_created_at ON dataset_files(created_at DESC)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_db_init() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let table_count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('fall_events', 'dataset_files')",
                [],
                |row| row.get(0),
            )
            .unwrap();

        assert_eq!(table_count, 2);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let versions: i32 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, 1);
    }

    #[test]
    fn test_init_db_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("events.db");

        init_db(Some(&path)).unwrap();
        assert!(path.exists());

        // Reopening an existing database keeps the schema
        let db = init_db(Some(&path)).unwrap();
        let conn = db.lock();
        let count: i32 = conn
            .query_row("SELECT COUNT(*) FROM fall_events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
