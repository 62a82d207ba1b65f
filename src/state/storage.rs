// File system operations for dataset windows and app data
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to get app data directory")]
    NoAppDataDir,
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Get the app data directory for fallwatch
pub fn get_app_data_dir() -> StorageResult<PathBuf> {
    let data_dir = dirs::data_dir().ok_or(StorageError::NoAppDataDir)?;
    let app_dir = data_dir.join("fallwatch");
    fs::create_dir_all(&app_dir)?;
    Ok(app_dir)
}

/// Default dataset directory under the app data directory
pub fn get_dataset_dir() -> StorageResult<PathBuf> {
    let dir = get_app_data_dir()?.join("datasets");
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// `dataset_label_{label}_{device}_{YYYYmmddHHMMSS}_{index}.json`
pub fn dataset_filename(label: u32, device_id: &str, at: DateTime<Utc>, index: u32) -> String {
    let device: String = device_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!(
        "dataset_label_{}_{}_{}_{}.json",
        label,
        device,
        at.format("%Y%m%d%H%M%S"),
        index
    )
}

/// Write `data` under `dir` and return its path and SHA256 hash
pub fn store_file(dir: &Path, filename: &str, data: &[u8]) -> StorageResult<(PathBuf, String)> {
    fs::create_dir_all(dir)?;

    let file_path = dir.join(filename);
    let mut file = fs::File::create(&file_path)?;
    file.write_all(data)?;

    Ok((file_path, calculate_sha256(data)))
}

/// Serialize `value` as pretty JSON under `dir`
pub fn store_json<T: serde::Serialize>(
    dir: &Path,
    filename: &str,
    value: &T,
) -> StorageResult<(PathBuf, String)> {
    let data = serde_json::to_vec_pretty(value)?;
    store_file(dir, filename, &data)
}

/// Calculate SHA256 hash of data
pub fn calculate_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
