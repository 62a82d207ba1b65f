// Persisted records
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alert::AlertEvent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallEvent {
    pub id: Uuid,
    pub window_id: Uuid,
    pub device_id: String,
    pub label: String,
    pub class_index: i64,
    pub confidence: f64,
    pub occurred_at: DateTime<Utc>,
    pub delivered: bool,
}

impl From<&AlertEvent> for FallEvent {
    fn from(event: &AlertEvent) -> Self {
        FallEvent {
            id: event.id,
            window_id: event.window_id,
            device_id: event.device_id.clone(),
            label: event.label.clone(),
            class_index: event.class_index as i64,
            confidence: event.confidence as f64,
            occurred_at: event.occurred_at,
            delivered: event.delivered,
        }
    }
}

/// A labeled window written to the dataset directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetFile {
    pub id: Uuid,
    pub device_id: String,
    pub label: u32,
    pub path: String,
    pub sha256: String,
    pub records: i64,
    pub created_at: DateTime<Utc>,
}
