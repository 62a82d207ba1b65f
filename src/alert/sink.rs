// Alert and persistence sink
// Publishes a notification and records a fall event once per triggering window

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::inference::{ActivityClass, ClassificationResult};
use crate::window::Window;

// Window ids remembered for per-window idempotence
const RECENT_WINDOW_LIMIT: usize = 256;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Publish to {topic} failed: {message}")]
    Publish { topic: String, message: String },

    #[error("Persisting fall event failed: {0}")]
    Persist(String),

    #[error("{operation} timed out after {limit:?}")]
    Timeout {
        operation: &'static str,
        limit: Duration,
    },
}

/// Outbound notification channel
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), SinkError>;
}

/// Durable record of fall events
pub trait FallEventStore: Send + Sync {
    fn record(&self, event: &AlertEvent) -> Result<(), SinkError>;
}

/// A detected fall, created once per triggering window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub window_id: Uuid,
    pub device_id: String,
    pub label: String,
    pub class_index: usize,
    pub confidence: f32,
    pub occurred_at: DateTime<Utc>,

    /// The notification reached the transport
    pub delivered: bool,

    /// The record reached the store
    pub persisted: bool,
}

#[derive(Debug, Clone)]
pub struct AlertPolicy {
    pub topic: String,
    pub fall_classes: BTreeSet<usize>,

    /// Suppress further alerts from the same device for this long
    pub debounce: Option<Duration>,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        AlertPolicy {
            topic: "fall-detection/alert".to_string(),
            fall_classes: ActivityClass::ALL
                .iter()
                .filter(|c| c.is_fall())
                .map(|c| c.index())
                .collect(),
            debounce: None,
        }
    }
}

#[derive(Debug, Default)]
struct AlertState {
    recent_windows: VecDeque<Uuid>,
    last_alert: HashMap<String, DateTime<Utc>>,
}

pub struct AlertSink {
    policy: AlertPolicy,
    publisher: Arc<dyn Publisher>,
    store: Arc<dyn FallEventStore>,
    state: Mutex<AlertState>,
}

impl AlertSink {
    pub fn new(
        policy: AlertPolicy,
        publisher: Arc<dyn Publisher>,
        store: Arc<dyn FallEventStore>,
    ) -> Self {
        AlertSink {
            policy,
            publisher,
            store,
            state: Mutex::new(AlertState::default()),
        }
    }

    pub fn policy(&self) -> &AlertPolicy {
        &self.policy
    }

    pub fn is_fall(&self, class_index: usize) -> bool {
        self.policy.fall_classes.contains(&class_index)
    }

    /// Raise an alert for a fall-class result
    ///
    /// Returns None for non-fall classes, for a window that was already
    /// dispatched, and for alerts suppressed by the debounce interval.
    /// Publish and persist failures are logged and reflected in the
    /// `delivered`/`persisted` flags.
    pub fn dispatch(
        &self,
        window: &Window,
        result: &ClassificationResult,
        occurred_at: DateTime<Utc>,
    ) -> Option<AlertEvent> {
        if !self.is_fall(result.predicted_index) {
            return None;
        }

        if !self.admit(&window.device_id, window.id, occurred_at) {
            return None;
        }

        let mut event = AlertEvent {
            id: Uuid::new_v4(),
            window_id: window.id,
            device_id: window.device_id.clone(),
            label: result.predicted_label.clone(),
            class_index: result.predicted_index,
            confidence: result.confidence,
            occurred_at,
            delivered: false,
            persisted: false,
        };

        let message = ActivityClass::from_index(result.predicted_index)
            .map(|c| c.alert_message())
            .unwrap_or("Fall detected");

        match self.publisher.publish(&self.policy.topic, message.as_bytes()) {
            Ok(()) => event.delivered = true,
            Err(e) => log::error!(
                "Alert for window {} (device {}, {}) not delivered: {}",
                event.window_id,
                event.device_id,
                event.label,
                e
            ),
        }

        match self.store.record(&event) {
            Ok(()) => event.persisted = true,
            Err(e) => log::error!(
                "Fall event {} for window {} (device {}) not persisted: {}",
                event.id,
                event.window_id,
                event.device_id,
                e
            ),
        }

        log::warn!(
            "FALL ALERT device={} label={} confidence={:.3} window={}",
            event.device_id,
            event.label,
            event.confidence,
            event.window_id
        );

        Some(event)
    }

    // Per-window idempotence, then the cross-window debounce
    fn admit(&self, device_id: &str, window_id: Uuid, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if state.recent_windows.contains(&window_id) {
            log::debug!("Window {} already dispatched, alert skipped", window_id);
            return false;
        }
        state.recent_windows.push_back(window_id);
        if state.recent_windows.len() > RECENT_WINDOW_LIMIT {
            state.recent_windows.pop_front();
        }

        if let (Some(debounce), Some(last)) = (self.policy.debounce, state.last_alert.get(device_id)) {
            let within = now
                .signed_duration_since(*last)
                .to_std()
                .map(|since| since < debounce)
                .unwrap_or(true);
            if within {
                log::info!(
                    "Alert for device {} suppressed, last alert at {}",
                    device_id,
                    last.to_rfc3339()
                );
                return false;
            }
        }

        state.last_alert.insert(device_id.to_string(), now);
        true
    }
}
