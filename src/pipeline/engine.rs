// Pipeline core
// Owns every device's trigger and turns payloads, commands and ticks into resampled windows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::ingest::{Sample, SampleDecoder, SessionError};
use crate::window::{
    resample, DrainedWindow, TargetLength, TriggerPolicy, TriggerReason, Window, WindowTrigger,
};

/// How windows reach the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Count/time/stop drains
    #[default]
    Triggered,
    /// Periodic copies of the newest samples; the buffer is never drained by the ticker
    Continuous,
}

/// Operator control signals
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// `device: None` applies to every device, including ones not seen yet
    Start {
        device: Option<String>,
        label: Option<u32>,
    },
    Stop {
        device: Option<String>,
    },
    Quit,
}

/// Everything the event loop consumes
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Payload {
        bytes: Vec<u8>,
        received_at: DateTime<Utc>,
    },
    Sample(Sample),
    Command(ControlCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowSource {
    Drain(TriggerReason),
    Snapshot,
}

/// A resampled window ready for classification
#[derive(Debug, Clone)]
pub struct ReadyWindow {
    pub window: Window,
    pub source: WindowSource,
    pub session_id: Option<Uuid>,

    /// Set for labeled drains, which are also written to the dataset directory
    pub dataset_index: Option<u32>,

    pub ready_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub mode: DispatchMode,
    pub policy: TriggerPolicy,
    pub target: TargetLength,
    pub snapshot_len: usize,

    /// Arm every device with an unlabeled session at startup
    pub auto_start: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings {
            mode: DispatchMode::Triggered,
            policy: TriggerPolicy::default(),
            target: TargetLength::default(),
            snapshot_len: 25,
            auto_start: false,
        }
    }
}

struct DeviceSlot {
    trigger: WindowTrigger,
    // Samples accepted so far, and the count at the last continuous snapshot
    ingested: u64,
    snapshot_mark: u64,
}

pub struct Pipeline {
    settings: PipelineSettings,
    decoder: SampleDecoder,
    devices: HashMap<String, DeviceSlot>,

    // Broadcast start label; devices first seen while armed start collecting
    armed: Option<Option<u32>>,

    // One-shot devices that finished their window since the last broadcast start
    completed: HashSet<String>,
}

impl Pipeline {
    pub fn new(settings: PipelineSettings, decoder: SampleDecoder) -> Self {
        let armed = settings.auto_start.then_some(None);
        Pipeline {
            settings,
            decoder,
            devices: HashMap::new(),
            armed,
            completed: HashSet::new(),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn armed(&self) -> Option<Option<u32>> {
        self.armed
    }

    pub fn trigger(&self, device_id: &str) -> Option<&WindowTrigger> {
        self.devices.get(device_id).map(|slot| &slot.trigger)
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Decode a transport payload and feed every sample in it
    pub fn handle_payload(&mut self, bytes: &[u8], received_at: DateTime<Utc>) -> Vec<ReadyWindow> {
        let samples = match self.decoder.decode(bytes, received_at.timestamp_millis()) {
            Ok(samples) => samples,
            Err(e) => {
                log::warn!(
                    "Dropped {}-byte payload received at {}: {}",
                    bytes.len(),
                    received_at.to_rfc3339(),
                    e
                );
                return Vec::new();
            }
        };

        samples
            .into_iter()
            .filter_map(|sample| self.handle_sample(sample, received_at))
            .collect()
    }

    pub fn handle_sample(&mut self, sample: Sample, now: DateTime<Utc>) -> Option<ReadyWindow> {
        let device_id = sample.device_id.clone();
        let timestamp_ms = sample.timestamp_ms;

        self.auto_arm(&device_id, now);
        // Only started or armed devices get a slot
        let Some(slot) = self.devices.get_mut(&device_id) else {
            log::debug!(
                "Dropped sample from device {} at {} ms: device not started",
                device_id,
                timestamp_ms
            );
            return None;
        };

        match slot.trigger.on_sample(sample, now) {
            Ok(drained) => {
                slot.ingested += 1;
                let idle_after = !slot.trigger.is_collecting();
                let drained = drained?;
                if idle_after && drained.reason != TriggerReason::Stop {
                    self.completed.insert(device_id);
                }
                self.prepare(drained)
            }
            Err(SessionError::NoActiveSession { .. }) => {
                log::debug!(
                    "Dropped sample from device {} at {} ms: no active session",
                    device_id,
                    timestamp_ms
                );
                None
            }
            Err(e) => {
                log::warn!(
                    "Dropped sample from device {} at {} ms: {}",
                    device_id,
                    timestamp_ms,
                    e
                );
                None
            }
        }
    }

    /// Start one device, or every known device and arm the rest
    pub fn start(
        &mut self,
        device: Option<&str>,
        label: Option<u32>,
        now: DateTime<Utc>,
    ) -> Vec<(String, Result<Uuid, SessionError>)> {
        let targets = match device {
            Some(id) => {
                self.completed.remove(id);
                vec![id.to_string()]
            }
            None => {
                self.armed = Some(label);
                self.completed.clear();
                log::info!("All devices armed (label {:?})", label);
                self.device_ids()
            }
        };

        targets
            .into_iter()
            .map(|id| {
                let result = self.slot(&id).trigger.start(label, now);
                if let Err(e) = &result {
                    log::warn!("Start rejected: {}", e);
                }
                (id, result)
            })
            .collect()
    }

    /// Stop one device, or disarm and stop every device
    pub fn stop(&mut self, device: Option<&str>, now: DateTime<Utc>) -> Vec<ReadyWindow> {
        let targets = match device {
            Some(id) => vec![id.to_string()],
            None => {
                if self.armed.take().is_some() {
                    log::info!("All devices disarmed");
                }
                self.device_ids()
            }
        };

        let mut ready = Vec::new();
        for id in targets {
            let Some(slot) = self.devices.get_mut(&id) else {
                log::warn!("Stop ignored: unknown device {}", id);
                continue;
            };
            if let Some(drained) = slot.trigger.stop(now) {
                ready.extend(self.prepare(drained));
            }
        }
        ready
    }

    /// Periodic evaluation: time drains, or continuous snapshots
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<ReadyWindow> {
        match self.settings.mode {
            DispatchMode::Triggered => {
                let mut drained = Vec::new();
                for (id, slot) in self.devices.iter_mut() {
                    if let Some(d) = slot.trigger.on_tick(now) {
                        if !slot.trigger.is_collecting() {
                            self.completed.insert(id.clone());
                        }
                        drained.push(d);
                    }
                }
                drained
                    .into_iter()
                    .filter_map(|d| self.prepare(d))
                    .collect()
            }
            DispatchMode::Continuous => self.snapshots(now),
        }
    }

    /// Apply the stop action to every device
    pub fn shutdown(&mut self, now: DateTime<Utc>) -> Vec<ReadyWindow> {
        self.stop(None, now)
    }

    fn snapshots(&mut self, now: DateTime<Utc>) -> Vec<ReadyWindow> {
        let snapshot_len = self.settings.snapshot_len;
        let target = self.settings.target;

        let mut ready = Vec::new();
        for (id, slot) in self.devices.iter_mut() {
            if slot.ingested == slot.snapshot_mark {
                continue;
            }
            let Some(samples) = slot.trigger.snapshot(snapshot_len) else {
                continue;
            };
            slot.snapshot_mark = slot.ingested;

            let label = slot.trigger.buffer().session().and_then(|s| s.label);
            match resample(&samples, target.resolve(samples.len())) {
                Ok(window) => ready.push(ReadyWindow {
                    window: window.with_label(label),
                    source: WindowSource::Snapshot,
                    session_id: slot.trigger.buffer().session().map(|s| s.id),
                    dataset_index: None,
                    ready_at: now,
                }),
                Err(e) => log::debug!("Snapshot of device {} skipped: {}", id, e),
            }
        }
        ready
    }

    fn prepare(&self, drained: DrainedWindow) -> Option<ReadyWindow> {
        let target_len = self.settings.target.resolve(drained.samples.len());

        match resample(&drained.samples, target_len) {
            Ok(window) => Some(ReadyWindow {
                window: window.with_label(drained.label),
                source: WindowSource::Drain(drained.reason),
                session_id: Some(drained.session_id),
                dataset_index: drained.label.map(|_| drained.dataset_index),
                ready_at: drained.drained_at,
            }),
            Err(e) => {
                log::warn!(
                    "Dropped window from session {} on device {} ({} to {}): {}",
                    drained.session_id,
                    drained.device_id,
                    drained.started_at.to_rfc3339(),
                    drained.drained_at.to_rfc3339(),
                    e
                );
                None
            }
        }
    }

    // Start a device that shows up while a broadcast start is active
    fn auto_arm(&mut self, device_id: &str, now: DateTime<Utc>) {
        let Some(label) = self.armed else {
            return;
        };
        if self.completed.contains(device_id) {
            return;
        }
        let slot = self.slot(device_id);
        if slot.trigger.is_collecting() {
            return;
        }
        if let Err(e) = slot.trigger.start(label, now) {
            log::warn!("Automatic start rejected: {}", e);
        }
    }

    fn slot(&mut self, device_id: &str) -> &mut DeviceSlot {
        let policy = &self.settings.policy;
        self.devices
            .entry(device_id.to_string())
            .or_insert_with(|| {
                log::info!("New device {}", device_id);
                DeviceSlot {
                    trigger: WindowTrigger::new(device_id, policy.clone()),
                    ingested: 0,
                    snapshot_mark: 0,
                }
            })
    }
}
