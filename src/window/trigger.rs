// Window trigger
// Per-device state machine deciding when a buffered window is ready for dispatch

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::ingest::{Sample, SessionBuffer, SessionError, SessionPolicy};

/// Where the trigger goes after a count/time drain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AfterDrain {
    /// Open a fresh session with the same label (continuous monitoring)
    #[default]
    Rearm,
    /// Wait for the next explicit start (one-shot dataset collection)
    Idle,
}

/// What an explicit stop does with the buffered samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopAction {
    #[default]
    Drain,
    Discard,
}

#[derive(Debug, Clone)]
pub struct TriggerPolicy {
    /// Drain once this many samples are buffered
    pub count_threshold: Option<usize>,

    /// Drain once this much wall time has passed since the session opened
    pub duration: Option<Duration>,

    pub after_drain: AfterDrain,
    pub stop_action: StopAction,
    pub capacity: usize,
    pub session_policy: SessionPolicy,
}

impl Default for TriggerPolicy {
    fn default() -> Self {
        TriggerPolicy {
            count_threshold: Some(25),
            duration: None,
            after_drain: AfterDrain::Rearm,
            stop_action: StopAction::Drain,
            capacity: 1200,
            session_policy: SessionPolicy::Reject,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerState {
    Idle,
    Collecting { label: Option<u32> },
    Draining { label: Option<u32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerReason {
    Count,
    Elapsed,
    Stop,
}

/// A closed session's samples, ready for resampling
#[derive(Debug, Clone)]
pub struct DrainedWindow {
    pub session_id: Uuid,
    pub device_id: String,
    pub label: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub drained_at: DateTime<Utc>,
    pub reason: TriggerReason,
    pub dataset_index: u32,
    pub samples: Vec<Sample>,
}

pub struct WindowTrigger {
    state: TriggerState,
    buffer: SessionBuffer,
    policy: TriggerPolicy,
}

impl WindowTrigger {
    pub fn new(device_id: impl Into<String>, policy: TriggerPolicy) -> Self {
        let buffer = SessionBuffer::new(device_id, policy.capacity, policy.session_policy);
        WindowTrigger {
            state: TriggerState::Idle,
            buffer,
            policy,
        }
    }

    pub fn state(&self) -> &TriggerState {
        &self.state
    }

    pub fn buffer(&self) -> &SessionBuffer {
        &self.buffer
    }

    pub fn device_id(&self) -> &str {
        self.buffer.device_id()
    }

    pub fn is_collecting(&self) -> bool {
        matches!(self.state, TriggerState::Collecting { .. })
    }

    /// Idle → Collecting; a running session is handled by the session policy
    pub fn start(&mut self, label: Option<u32>, now: DateTime<Utc>) -> Result<Uuid, SessionError> {
        let session_id = self.buffer.open(label, now)?;
        self.state = TriggerState::Collecting { label };
        log::info!(
            "Session {} started on device {} (label {:?})",
            session_id,
            self.device_id(),
            label
        );
        Ok(session_id)
    }

    /// Append a sample, draining if a threshold is reached
    pub fn on_sample(
        &mut self,
        sample: Sample,
        now: DateTime<Utc>,
    ) -> Result<Option<DrainedWindow>, SessionError> {
        self.buffer.ingest(sample)?;

        Ok(match self.due(now) {
            Some(reason) => self.drain(reason, now),
            None => None,
        })
    }

    /// Periodic check of the time threshold, for devices that went quiet
    pub fn on_tick(&mut self, now: DateTime<Utc>) -> Option<DrainedWindow> {
        if !self.is_collecting() || !self.elapsed(now) {
            return None;
        }

        if self.buffer.is_empty() {
            // Nothing arrived during the interval, start counting again
            self.buffer.restart(now);
            return None;
        }

        self.drain(TriggerReason::Elapsed, now)
    }

    /// Explicit stop from any state, ends Idle
    pub fn stop(&mut self, now: DateTime<Utc>) -> Option<DrainedWindow> {
        if !self.is_collecting() {
            return None;
        }

        match self.policy.stop_action {
            StopAction::Drain if !self.buffer.is_empty() => self.drain(TriggerReason::Stop, now),
            _ => {
                if let Some(discarded) = self.buffer.drain() {
                    log::info!(
                        "Session {} on device {} stopped, {} samples discarded",
                        discarded.session_id,
                        discarded.device_id,
                        discarded.samples.len()
                    );
                }
                self.state = TriggerState::Idle;
                None
            }
        }
    }

    /// Copy of the newest `n` samples while collecting
    pub fn snapshot(&self, n: usize) -> Option<Vec<Sample>> {
        if self.is_collecting() {
            Some(self.buffer.snapshot_last(n))
        } else {
            None
        }
    }

    // Count is checked first; one reason per evaluation
    fn due(&self, now: DateTime<Utc>) -> Option<TriggerReason> {
        if let Some(threshold) = self.policy.count_threshold {
            if self.buffer.len() >= threshold {
                return Some(TriggerReason::Count);
            }
        }
        if self.elapsed(now) {
            return Some(TriggerReason::Elapsed);
        }
        None
    }

    fn elapsed(&self, now: DateTime<Utc>) -> bool {
        let (Some(duration), Some(session)) = (self.policy.duration, self.buffer.session()) else {
            return false;
        };
        now.signed_duration_since(session.started_at)
            .to_std()
            .map(|elapsed| elapsed >= duration)
            .unwrap_or(false)
    }

    fn drain(&mut self, reason: TriggerReason, now: DateTime<Utc>) -> Option<DrainedWindow> {
        let label = match self.state {
            TriggerState::Collecting { label } => label,
            _ => return None,
        };
        self.state = TriggerState::Draining { label };

        let Some(drained) = self.buffer.drain() else {
            self.state = TriggerState::Idle;
            return None;
        };
        let dataset_index = self.buffer.next_dataset_index(label);

        self.state = match (reason, self.policy.after_drain) {
            (TriggerReason::Stop, _) | (_, AfterDrain::Idle) => TriggerState::Idle,
            (_, AfterDrain::Rearm) => match self.buffer.open(label, now) {
                Ok(_) => TriggerState::Collecting { label },
                Err(e) => {
                    log::error!("Failed to re-arm device {}: {}", drained.device_id, e);
                    TriggerState::Idle
                }
            },
        };

        log::debug!(
            "Drained session {} on device {}: {} samples ({:?})",
            drained.session_id,
            drained.device_id,
            drained.samples.len(),
            reason
        );

        Some(DrainedWindow {
            session_id: drained.session_id,
            device_id: drained.device_id,
            label: drained.label,
            started_at: drained.started_at,
            drained_at: now,
            reason,
            dataset_index,
            samples: drained.samples,
        })
    }
}
