// Database operations for fall events and dataset files
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use super::db::{DbConnection, DbError, DbResult};
use super::models::{DatasetFile, FallEvent};

fn parse_uuid(table: &'static str, value: &str) -> DbResult<Uuid> {
    Uuid::parse_str(value).map_err(|e| DbError::CorruptRow {
        table,
        message: format!("bad id {:?}: {}", value, e),
    })
}

fn parse_time(table: &'static str, value: &str) -> DbResult<DateTime<Utc>> {
    value.parse().map_err(|e| DbError::CorruptRow {
        table,
        message: format!("bad timestamp {:?}: {}", value, e),
    })
}

// ==================== FALL EVENT QUERIES ====================

const FALL_EVENT_COLUMNS: &str =
    "id, window_id, device_id, label, class_index, confidence, occurred_at, delivered";

struct FallEventRow {
    id: String,
    window_id: String,
    device_id: String,
    label: String,
    class_index: i64,
    confidence: f64,
    occurred_at: String,
    delivered: bool,
}

impl FallEventRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(FallEventRow {
            id: row.get(0)?,
            window_id: row.get(1)?,
            device_id: row.get(2)?,
            label: row.get(3)?,
            class_index: row.get(4)?,
            confidence: row.get(5)?,
            occurred_at: row.get(6)?,
            delivered: row.get(7)?,
        })
    }

    fn into_event(self) -> DbResult<FallEvent> {
        Ok(FallEvent {
            id: parse_uuid("fall_events", &self.id)?,
            window_id: parse_uuid("fall_events", &self.window_id)?,
            device_id: self.device_id,
            label: self.label,
            class_index: self.class_index,
            confidence: self.confidence,
            occurred_at: parse_time("fall_events", &self.occurred_at)?,
            delivered: self.delivered,
        })
    }
}

/// Insert a fall event; returns false when its window was already recorded
pub fn insert_fall_event(db: &DbConnection, event: &FallEvent) -> DbResult<bool> {
    let conn = db.lock();
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO fall_events (id, window_id, device_id, label, class_index, confidence, occurred_at, delivered)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event.id.to_string(),
            event.window_id.to_string(),
            event.device_id,
            event.label,
            event.class_index,
            event.confidence,
            event.occurred_at.to_rfc3339(),
            event.delivered,
        ],
    )?;

    Ok(inserted == 1)
}

/// Most recent fall events first
pub fn list_fall_events(db: &DbConnection, limit: usize) -> DbResult<Vec<FallEvent>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM fall_events ORDER BY occurred_at DESC LIMIT ?1",
        FALL_EVENT_COLUMNS
    ))?;

    let rows = stmt
        .query_map([limit as i64], FallEventRow::read)?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(FallEventRow::into_event).collect()
}

pub fn list_fall_events_for_device(
    db: &DbConnection,
    device_id: &str,
    limit: usize,
) -> DbResult<Vec<FallEvent>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM fall_events WHERE device_id = ?1 ORDER BY occurred_at DESC LIMIT ?2",
        FALL_EVENT_COLUMNS
    ))?;

    let rows = stmt
        .query_map(params![device_id, limit as i64], FallEventRow::read)?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(FallEventRow::into_event).collect()
}

pub fn count_fall_events(db: &DbConnection) -> DbResult<i64> {
    let conn = db.lock();
    let count = conn.query_row("SELECT COUNT(*) FROM fall_events", [], |row| row.get(0))?;
    Ok(count)
}

// ==================== DATASET FILE QUERIES ====================

/// Record a dataset file written to disk
pub fn insert_dataset_file(
    db: &DbConnection,
    device_id: &str,
    label: u32,
    path: String,
    sha256: String,
    records: i64,
) -> DbResult<DatasetFile> {
    let file = DatasetFile {
        id: Uuid::new_v4(),
        device_id: device_id.to_string(),
        label,
        path,
        sha256,
        records,
        created_at: Utc::now(),
    };

    let conn = db.lock();
    conn.execute(
        "INSERT INTO dataset_files (id, device_id, label, path, sha256, records, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            file.id.to_string(),
            file.device_id,
            file.label,
            file.path,
            file.sha256,
            file.records,
            file.created_at.to_rfc3339(),
        ],
    )?;

    Ok(file)
}

/// All dataset files, optionally restricted to one label
pub fn list_dataset_files(db: &DbConnection, label: Option<u32>) -> DbResult<Vec<DatasetFile>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT id, device_id, label, path, sha256, records, created_at
         FROM dataset_files
         WHERE ?1 IS NULL OR label = ?1
         ORDER BY created_at DESC",
    )?;

    let rows = stmt
        .query_map([label], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, device_id, label, path, sha256, records, created_at)| {
            Ok(DatasetFile {
                id: parse_uuid("dataset_files", &id)?,
                device_id,
                label,
                path,
                sha256,
                records,
                created_at: parse_time("dataset_files", &created_at)?,
            })
        })
        .collect()
}
