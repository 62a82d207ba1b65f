// State management module
// Handles SQLite persistence and file system operations

pub mod dataset;
pub mod db;
pub mod fall_store;
pub mod models;
pub mod queries;
pub mod storage;

pub use dataset::DatasetWriter;
pub use db::{init_db, open_in_memory, DbConnection, DbError};
pub use fall_store::SqliteFallStore;
pub use models::{DatasetFile, FallEvent};
pub use queries::{
    count_fall_events, insert_dataset_file, insert_fall_event, list_dataset_files,
    list_fall_events, list_fall_events_for_device,
};
pub use storage::StorageError;
