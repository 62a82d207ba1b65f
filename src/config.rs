// Application configuration
// JSON file with per-field defaults, overridden by command-line flags, validated before startup

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::alert::AlertPolicy;
use crate::inference::{TensorLayout, CLASS_COUNT};
use crate::ingest::{ByteOrder, SampleDecoder, SessionPolicy, WireFormat};
use crate::pipeline::{DispatchMode, PipelineSettings, ServiceTimings};
use crate::transport::MqttSettings;
use crate::window::{AfterDrain, Channel, StopAction, TargetLength, TriggerPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub transport: TransportConfig,
    pub window: WindowConfig,
    pub inference: InferenceConfig,
    pub alert: AlertConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub subscribe_topic: String,
    pub keep_alive_secs: u64,
    pub wire_format: WireFormat,
    pub byte_order: ByteOrder,

    /// Device id for JSON payloads without an `ID` field
    pub default_device_id: String,

    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,

    /// Bound of the transport → pipeline channel
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "fallwatch".to_string(),
            subscribe_topic: "fall-detection/sensor/gyro".to_string(),
            keep_alive_secs: 60,
            wire_format: WireFormat::Auto,
            byte_order: ByteOrder::Little,
            default_device_id: "unknown".to_string(),
            max_reconnect_attempts: 10,
            reconnect_delay_ms: 2000,
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub mode: DispatchMode,
    pub target: TargetLength,
    pub count_threshold: Option<usize>,
    pub duration_secs: Option<f64>,
    pub capacity: usize,
    pub after_drain: AfterDrain,
    pub stop_action: StopAction,
    pub session_policy: SessionPolicy,
    pub auto_start: bool,
    pub snapshot_len: usize,
    pub poll_interval_ms: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            mode: DispatchMode::Triggered,
            target: TargetLength::default(),
            count_threshold: Some(25),
            duration_secs: None,
            capacity: 1200,
            after_drain: AfterDrain::Rearm,
            stop_action: StopAction::Drain,
            session_policy: SessionPolicy::Reject,
            auto_start: false,
            snapshot_len: 25,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// No model means a collection-only deployment
    pub model_path: Option<PathBuf>,
    pub channels: Vec<Channel>,
    pub layout: TensorLayout,
    pub timeout_ms: u64,
    pub max_in_flight: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        InferenceConfig {
            model_path: None,
            channels: vec![Channel::GyroX, Channel::GyroY, Channel::GyroZ],
            layout: TensorLayout::ChannelsFirst,
            timeout_ms: 2000,
            max_in_flight: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub topic: String,
    pub fall_classes: Vec<usize>,
    pub debounce_secs: Option<u64>,
    pub timeout_ms: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        AlertConfig {
            topic: "fall-detection/alert".to_string(),
            fall_classes: vec![2, 3, 4],
            debounce_secs: None,
            timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Defaults to `fallwatch.db` in the platform data directory
    pub database_path: Option<PathBuf>,

    /// Labeled windows are written here; defaults to `datasets/` in the data directory
    pub dataset_dir: Option<PathBuf>,

    pub trace_path: Option<PathBuf>,
    pub shutdown_grace_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            database_path: None,
            dataset_dir: None,
            trace_path: None,
            shutdown_grace_ms: 5000,
        }
    }
}

impl AppConfig {
    /// Read a config file, or the defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(AppConfig::default());
        };

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let w = &self.window;

        if w.mode == DispatchMode::Triggered && w.count_threshold.is_none() && w.duration_secs.is_none() {
            return invalid(
                "triggered mode needs window.count_threshold or window.duration_secs".to_string(),
            );
        }
        if w.count_threshold == Some(0) {
            return invalid("window.count_threshold must be greater than 0".to_string());
        }
        if let Some(secs) = w.duration_secs {
            if secs <= 0.0 || Duration::try_from_secs_f64(secs).is_err() {
                return invalid(format!(
                    "window.duration_secs must be a positive representable duration, got {}",
                    secs
                ));
            }
        }
        if let Some(threshold) = w.count_threshold {
            if w.capacity < threshold {
                return invalid(format!(
                    "window.capacity {} is below window.count_threshold {}",
                    w.capacity, threshold
                ));
            }
        }
        if w.snapshot_len < 2 {
            return invalid(format!("window.snapshot_len must be at least 2, got {}", w.snapshot_len));
        }
        if w.capacity < w.snapshot_len {
            return invalid(format!(
                "window.capacity {} is below window.snapshot_len {}",
                w.capacity, w.snapshot_len
            ));
        }
        match w.target {
            TargetLength::Fixed(n) if n < 2 => {
                return invalid(format!("window.target fixed length must be at least 2, got {}", n));
            }
            TargetLength::Scaled { source_hz, target_hz }
                if !(source_hz > 0.0 && target_hz > 0.0) =>
            {
                return invalid("window.target rates must be positive".to_string());
            }
            _ => {}
        }
        if w.poll_interval_ms == 0 {
            return invalid("window.poll_interval_ms must be greater than 0".to_string());
        }

        if let Some(bad) = self.alert.fall_classes.iter().find(|&&c| c >= CLASS_COUNT) {
            return invalid(format!(
                "alert.fall_classes entry {} is outside the {} known classes",
                bad, CLASS_COUNT
            ));
        }

        if self.inference.channels.is_empty() {
            return invalid("inference.channels must not be empty".to_string());
        }
        if self.inference.max_in_flight == 0 {
            return invalid("inference.max_in_flight must be greater than 0".to_string());
        }

        if self.transport.port == 0 {
            return invalid("transport.port must not be 0".to_string());
        }
        if self.transport.channel_capacity == 0 {
            return invalid("transport.channel_capacity must be greater than 0".to_string());
        }

        Ok(())
    }

    pub fn trigger_policy(&self) -> TriggerPolicy {
        let w = &self.window;
        let (count_threshold, duration) = match w.mode {
            DispatchMode::Triggered => (
                w.count_threshold,
                w.duration_secs
                    .and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
            ),
            // The ticker reads snapshots; sessions never drain on their own
            DispatchMode::Continuous => (None, None),
        };

        TriggerPolicy {
            count_threshold,
            duration,
            after_drain: w.after_drain,
            stop_action: w.stop_action,
            capacity: w.capacity,
            session_policy: w.session_policy,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            mode: self.window.mode,
            policy: self.trigger_policy(),
            target: self.window.target,
            snapshot_len: self.window.snapshot_len,
            auto_start: self.window.auto_start || self.window.mode == DispatchMode::Continuous,
        }
    }

    pub fn decoder(&self) -> SampleDecoder {
        SampleDecoder::new(
            self.transport.wire_format,
            self.transport.byte_order,
            self.transport.default_device_id.clone(),
        )
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        let t = &self.transport;
        MqttSettings {
            host: t.host.clone(),
            port: t.port,
            client_id: t.client_id.clone(),
            subscribe_topic: t.subscribe_topic.clone(),
            keep_alive: Duration::from_secs(t.keep_alive_secs),
            max_reconnect_attempts: t.max_reconnect_attempts,
            reconnect_delay: Duration::from_millis(t.reconnect_delay_ms),
            request_capacity: 64,
        }
    }

    pub fn alert_policy(&self) -> AlertPolicy {
        AlertPolicy {
            topic: self.alert.topic.clone(),
            fall_classes: self.alert.fall_classes.iter().copied().collect(),
            debounce: self.alert.debounce_secs.map(Duration::from_secs),
        }
    }

    pub fn service_timings(&self) -> ServiceTimings {
        ServiceTimings {
            poll_interval: Duration::from_millis(self.window.poll_interval_ms),
            inference_timeout: Duration::from_millis(self.inference.timeout_ms),
            sink_timeout: Duration::from_millis(self.alert.timeout_ms),
            max_in_flight: self.inference.max_in_flight,
            shutdown_grace: Duration::from_millis(self.storage.shutdown_grace_ms),
        }
    }
}
