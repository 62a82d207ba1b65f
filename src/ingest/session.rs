// Session buffer
// Per-device accumulation of samples for one labeled or unlabeled collection interval

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use uuid::Uuid;

use super::decode::Sample;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session {session_id} already active for device {device_id}")]
    AlreadyActive { device_id: String, session_id: Uuid },

    #[error("No active session for device {device_id}, sample at {timestamp_ms} ms dropped")]
    NoActiveSession { device_id: String, timestamp_ms: i64 },
}

/// What `open` does when a session is already running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPolicy {
    /// Refuse the new session, the running one continues
    #[default]
    Reject,
    /// Discard the running session and open a fresh one
    Replace,
}

/// An open collection interval
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub label: Option<u32>,
    pub started_at: DateTime<Utc>,
    samples: VecDeque<Sample>,
    evicted: u64,
}

impl Session {
    // Grows with the stream; `SessionBuffer::ingest` enforces the capacity
    fn new(label: Option<u32>, started_at: DateTime<Utc>) -> Self {
        Session {
            id: Uuid::new_v4(),
            label,
            started_at,
            samples: VecDeque::new(),
            evicted: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &VecDeque<Sample> {
        &self.samples
    }

    /// Samples dropped from the front because the buffer was full
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

/// Samples moved out of a closed session
#[derive(Debug, Clone)]
pub struct SessionDrain {
    pub session_id: Uuid,
    pub device_id: String,
    pub label: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub samples: Vec<Sample>,
    pub evicted: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Buffered samples after the append
    pub len: usize,
    /// The oldest sample was dropped to make room
    pub evicted: bool,
    /// The device clock went backwards and the sequence was cleared
    pub restarted: bool,
}

/// Bounded FIFO sample buffer for a single device
#[derive(Debug)]
pub struct SessionBuffer {
    device_id: String,
    capacity: usize,
    policy: SessionPolicy,
    active: Option<Session>,
    // label -> next dataset file index
    dataset_index: HashMap<Option<u32>, u32>,
}

impl SessionBuffer {
    pub fn new(device_id: impl Into<String>, capacity: usize, policy: SessionPolicy) -> Self {
        SessionBuffer {
            device_id: device_id.into(),
            capacity: capacity.max(1),
            policy,
            active: None,
            dataset_index: HashMap::new(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn session(&self) -> Option<&Session> {
        self.active.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn len(&self) -> usize {
        self.active.as_ref().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open a session, honoring the replacement policy
    pub fn open(&mut self, label: Option<u32>, now: DateTime<Utc>) -> Result<Uuid, SessionError> {
        if let Some(current) = &self.active {
            match self.policy {
                SessionPolicy::Reject => {
                    return Err(SessionError::AlreadyActive {
                        device_id: self.device_id.clone(),
                        session_id: current.id,
                    });
                }
                SessionPolicy::Replace => {
                    log::warn!(
                        "Replacing session {} on device {}: {} buffered samples discarded",
                        current.id,
                        self.device_id,
                        current.len()
                    );
                }
            }
        }

        let session = Session::new(label, now);
        let id = session.id;
        self.active = Some(session);
        Ok(id)
    }

    /// Append a sample to the active session
    pub fn ingest(&mut self, sample: Sample) -> Result<IngestOutcome, SessionError> {
        let capacity = self.capacity;
        let session = match self.active.as_mut() {
            Some(session) => session,
            None => {
                return Err(SessionError::NoActiveSession {
                    device_id: self.device_id.clone(),
                    timestamp_ms: sample.timestamp_ms,
                });
            }
        };

        let mut restarted = false;
        if let Some(last) = session.samples.back() {
            if sample.timestamp_ms < last.timestamp_ms {
                log::warn!(
                    "Device {} clock went back from {} to {} ms in session {}, treating as restart",
                    self.device_id,
                    last.timestamp_ms,
                    sample.timestamp_ms,
                    session.id
                );
                session.samples.clear();
                restarted = true;
            }
        }

        let mut evicted = false;
        while session.samples.len() >= capacity {
            session.samples.pop_front();
            session.evicted += 1;
            evicted = true;
        }

        session.samples.push_back(sample);

        Ok(IngestOutcome {
            len: session.samples.len(),
            evicted,
            restarted,
        })
    }

    /// Clear the sequence, keeping the session open
    pub fn reset(&mut self) {
        if let Some(session) = self.active.as_mut() {
            session.samples.clear();
        }
    }

    /// Restart the session clock without touching the buffered samples
    pub fn restart(&mut self, now: DateTime<Utc>) {
        if let Some(session) = self.active.as_mut() {
            session.started_at = now;
        }
    }

    /// Close the session and move its samples out
    pub fn drain(&mut self) -> Option<SessionDrain> {
        self.active.take().map(|session| SessionDrain {
            session_id: session.id,
            device_id: self.device_id.clone(),
            label: session.label,
            started_at: session.started_at,
            samples: session.samples.into_iter().collect(),
            evicted: session.evicted,
        })
    }

    /// Copy of the newest `n` samples (fewer if not buffered yet)
    pub fn snapshot_last(&self, n: usize) -> Vec<Sample> {
        match &self.active {
            Some(session) => {
                let skip = session.samples.len().saturating_sub(n);
                session.samples.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Next dataset file index for a label, counting up per call
    pub fn next_dataset_index(&mut self, label: Option<u32>) -> u32 {
        let counter = self.dataset_index.entry(label).or_insert(0);
        let index = *counter;
        *counter += 1;
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: i64, x: f64) -> Sample {
        Sample::new("dev", ts, x, 0.0, 0.0)
    }

    #[test]
    fn test_ingest_without_session_fails() {
        let mut buffer = SessionBuffer::new("dev", 10, SessionPolicy::Reject);
        let err = buffer.ingest(sample(0, 1.0)).unwrap_err();

        assert!(matches!(err, SessionError::NoActiveSession { timestamp_ms: 0, .. }));
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_capacity_is_never_exceeded() {
        let mut buffer = SessionBuffer::new("dev", 4, SessionPolicy::Reject);
        buffer.open(None, Utc::now()).unwrap();

        for i in 0..50 {
            let outcome = buffer.ingest(sample(i, i as f64)).unwrap();
            assert!(outcome.len <= 4);
            assert!(buffer.len() <= 4);
        }

        // Oldest evicted first
        let kept: Vec<f64> = buffer.snapshot_last(4).iter().map(|s| s.gyro_x).collect();
        assert_eq!(kept, vec![46.0, 47.0, 48.0, 49.0]);
        assert_eq!(buffer.session().unwrap().evicted(), 46);
    }

    #[test]
    fn test_reject_policy_keeps_running_session() {
        let mut buffer = SessionBuffer::new("dev", 10, SessionPolicy::Reject);
        let first = buffer.open(Some(1), Utc::now()).unwrap();
        buffer.ingest(sample(0, 1.0)).unwrap();

        let err = buffer.open(Some(2), Utc::now()).unwrap_err();
        match err {
            SessionError::AlreadyActive { session_id, .. } => assert_eq!(session_id, first),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(buffer.session().unwrap().label, Some(1));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_replace_policy_discards_running_session() {
        let mut buffer = SessionBuffer::new("dev", 10, SessionPolicy::Replace);
        let first = buffer.open(Some(1), Utc::now()).unwrap();
        buffer.ingest(sample(0, 1.0)).unwrap();

        let second = buffer.open(Some(2), Utc::now()).unwrap();
        assert_ne!(first, second);
        assert_eq!(buffer.session().unwrap().label, Some(2));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_reset_keeps_session_open() {
        let mut buffer = SessionBuffer::new("dev", 10, SessionPolicy::Reject);
        let id = buffer.open(None, Utc::now()).unwrap();
        buffer.ingest(sample(0, 1.0)).unwrap();
        buffer.reset();

        assert!(buffer.is_active());
        assert_eq!(buffer.session().unwrap().id, id);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_moves_samples_and_closes() {
        let mut buffer = SessionBuffer::new("dev", 10, SessionPolicy::Reject);
        let id = buffer.open(Some(3), Utc::now()).unwrap();
        for i in 0..3 {
            buffer.ingest(sample(i, i as f64)).unwrap();
        }

        let drained = buffer.drain().unwrap();
        assert_eq!(drained.session_id, id);
        assert_eq!(drained.label, Some(3));
        assert_eq!(drained.device_id, "dev");
        assert_eq!(drained.samples.len(), 3);
        assert!(!buffer.is_active());
        assert!(buffer.drain().is_none());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut buffer = SessionBuffer::new("dev", 10, SessionPolicy::Reject);
        buffer.open(None, Utc::now()).unwrap();
        for i in 0..5 {
            buffer.ingest(sample(i, i as f64)).unwrap();
        }

        let snapshot = buffer.snapshot_last(3);
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].gyro_x, 2.0);
        assert_eq!(buffer.len(), 5);

        assert_eq!(buffer.snapshot_last(20).len(), 5);
    }

    #[test]
    fn test_clock_regression_clears_sequence() {
        let mut buffer = SessionBuffer::new("dev", 10, SessionPolicy::Reject);
        buffer.open(None, Utc::now()).unwrap();
        buffer.ingest(sample(100, 1.0)).unwrap();
        buffer.ingest(sample(200, 2.0)).unwrap();

        let outcome = buffer.ingest(sample(5, 3.0)).unwrap();
        assert!(outcome.restarted);
        assert_eq!(outcome.len, 1);

        // Equal timestamps are allowed
        let outcome = buffer.ingest(sample(5, 4.0)).unwrap();
        assert!(!outcome.restarted);
        assert_eq!(outcome.len, 2);
    }

    #[test]
    fn test_dataset_index_counts_per_label() {
        let mut buffer = SessionBuffer::new("dev", 10, SessionPolicy::Reject);
        assert_eq!(buffer.next_dataset_index(Some(2)), 0);
        assert_eq!(buffer.next_dataset_index(Some(2)), 1);
        assert_eq!(buffer.next_dataset_index(Some(4)), 0);
        assert_eq!(buffer.next_dataset_index(None), 0);
        assert_eq!(buffer.next_dataset_index(Some(2)), 2);
    }
}
