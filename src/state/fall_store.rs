// SQLite-backed fall event store for the alert sink
use crate::alert::{AlertEvent, FallEventStore, SinkError};

use super::db::DbConnection;
use super::models::FallEvent;
use super::queries::insert_fall_event;

#[derive(Clone)]
pub struct SqliteFallStore {
    db: DbConnection,
}

impl SqliteFallStore {
    pub fn new(db: DbConnection) -> Self {
        SqliteFallStore { db }
    }
}

impl FallEventStore for SqliteFallStore {
    fn record(&self, event: &AlertEvent) -> Result<(), SinkError> {
        let inserted = insert_fall_event(&self.db, &FallEvent::from(event))
            .map_err(|e| SinkError::Persist(e.to_string()))?;

        if !inserted {
            log::debug!(
                "Fall event for window {} was already recorded",
                event.window_id
            );
        }
        Ok(())
    }
}
