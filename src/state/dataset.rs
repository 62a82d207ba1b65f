// Labeled window output for model training
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use super::db::{DbConnection, DbResult};
use super::models::DatasetFile;
use super::queries::insert_dataset_file;
use super::storage::{dataset_filename, store_json};
use crate::window::Window;

/// Writes labeled windows as JSON record arrays and indexes them in `dataset_files`
#[derive(Clone)]
pub struct DatasetWriter {
    dir: PathBuf,
    db: DbConnection,
}

impl DatasetWriter {
    pub fn new(dir: PathBuf, db: DbConnection) -> Self {
        DatasetWriter { dir, db }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Unlabeled windows have no place in the dataset and return None
    pub fn write(
        &self,
        window: &Window,
        index: u32,
        at: DateTime<Utc>,
    ) -> DbResult<Option<DatasetFile>> {
        let Some(label) = window.label else {
            return Ok(None);
        };

        let records = window.to_records();
        let filename = dataset_filename(label, &window.device_id, at, index);
        let (path, sha256) = store_json(&self.dir, &filename, &records)?;

        let file = insert_dataset_file(
            &self.db,
            &window.device_id,
            label,
            path.to_string_lossy().to_string(),
            sha256,
            records.len() as i64,
        )?;

        log::info!(
            "Saved {} records for label {} from device {} to {}",
            records.len(),
            label,
            window.device_id,
            path.display()
        );
        Ok(Some(file))
    }
}
