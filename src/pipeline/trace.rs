// Dispatch tracing
// Append-only JSONL trace with one entry per window stage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::window::Window;

/// Errors that can occur during trace operations
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStage {
    Resample,
    Classify,
    Alert,
    Dataset,
}

/// A single trace entry in the dispatch log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub timestamp: DateTime<Utc>,

    pub stage: TraceStage,

    pub device_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_id: Option<Uuid>,

    /// First and last sample timestamps of the window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_ms: Option<i64>,

    pub message: String,

    /// Optional structured data (probabilities, predicted label, file path)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl TraceEntry {
    /// Serialize to JSON line (with newline)
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        Ok(format!("{}\n", json))
    }
}

/// Appends entries to a JSONL file, creating it on first write
pub struct TraceWriter {
    file_path: PathBuf,
    lock: Mutex<()>,
}

impl TraceWriter {
    pub fn new(file_path: PathBuf) -> Self {
        TraceWriter {
            file_path,
            lock: Mutex::new(()),
        }
    }

    pub fn write(&self, entry: &TraceEntry) -> Result<(), TraceError> {
        let json_line = entry.to_json_line()?;

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        file.write_all(json_line.as_bytes())?;
        file.flush()?;

        Ok(())
    }

    /// Trace failures never stop a dispatch
    pub fn record(&self, entry: TraceEntry) {
        if let Err(e) = self.write(&entry) {
            log::warn!(
                "Failed to write {:?} trace for device {} to {}: {}",
                entry.stage,
                entry.device_id,
                self.file_path.display(),
                e
            );
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }
}

/// Helper builder for creating trace entries
pub struct TraceBuilder {
    entry: TraceEntry,
}

impl TraceBuilder {
    pub fn stage(stage: TraceStage, device_id: impl Into<String>) -> Self {
        TraceBuilder {
            entry: TraceEntry {
                timestamp: Utc::now(),
                stage,
                device_id: device_id.into(),
                window_id: None,
                start_ms: None,
                end_ms: None,
                message: String::new(),
                data: None,
            },
        }
    }

    /// Window id and boundaries
    pub fn window(mut self, window: &Window) -> Self {
        self.entry.window_id = Some(window.id);
        self.entry.start_ms = Some(window.start_ms());
        self.entry.end_ms = Some(window.end_ms());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.entry.data = Some(data);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> TraceEntry {
        self.entry.message = message.into();
        self.entry
    }
}

/// Read trace entries from a JSONL file
pub fn read_trace_file(path: &Path) -> Result<Vec<TraceEntry>, TraceError> {
    let contents = std::fs::read_to_string(path)?;
    let mut entries = Vec::new();

    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }

        let entry: TraceEntry = serde_json::from_str(line)?;
        entries.push(entry);
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::Sample;
    use crate::window::resample;
    use tempfile::TempDir;

    fn window() -> Window {
        let samples = vec![
            Sample::new("A", 1000, 0.0, 0.0, 0.0),
            Sample::new("A", 1200, 1.0, 1.0, 1.0),
        ];
        resample(&samples, 5).unwrap()
    }

    #[test]
    fn test_builder_carries_window_bounds() {
        let w = window();
        let entry = TraceBuilder::stage(TraceStage::Resample, "A")
            .window(&w)
            .message("Resampled 2 samples to 5");

        assert_eq!(entry.stage, TraceStage::Resample);
        assert_eq!(entry.window_id, Some(w.id));
        assert_eq!(entry.start_ms, Some(1000));
        assert_eq!(entry.end_ms, Some(1200));
        assert!(entry.data.is_none());
    }

    #[test]
    fn test_trace_writer() {
        let temp_dir = TempDir::new().unwrap();
        let trace_path = temp_dir.path().join("trace.jsonl");
        let writer = TraceWriter::new(trace_path.clone());
        let w = window();

        writer
            .write(&TraceBuilder::stage(TraceStage::Resample, "A").window(&w).message("resampled"))
            .unwrap();
        writer.record(
            TraceBuilder::stage(TraceStage::Classify, "A")
                .window(&w)
                .data(serde_json::json!({"predicted_label": "walking", "probabilities": [0.1, 0.9]}))
                .message("classified"),
        );

        let entries = read_trace_file(&trace_path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].stage, TraceStage::Resample);
        assert_eq!(entries[1].stage, TraceStage::Classify);
        assert_eq!(entries[1].data.as_ref().unwrap()["predicted_label"], "walking");
    }

    #[test]
    fn test_json_line_format() {
        let entry = TraceBuilder::stage(TraceStage::Alert, "B").message("alert raised");
        let json_line = entry.to_json_line().unwrap();

        assert!(json_line.ends_with('\n'));
        assert!(json_line.contains("\"stage\":\"alert\""));
        assert!(!json_line.contains("window_id"));

        let parsed: TraceEntry = serde_json::from_str(json_line.trim()).unwrap();
        assert_eq!(parsed.device_id, "B");
    }

    #[test]
    fn test_record_swallows_io_errors() {
        let temp_dir = TempDir::new().unwrap();
        let writer = TraceWriter::new(temp_dir.path().join("missing").join("trace.jsonl"));

        writer.record(TraceBuilder::stage(TraceStage::Dataset, "A").message("written"));
        assert!(!writer.path().exists());
    }
}
