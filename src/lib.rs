// fallwatch - Wearable gyroscope stream to fall alerts
// Module declarations and service wiring

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod alert;
pub mod commands;
pub mod config;
pub mod inference;
pub mod ingest;
pub mod pipeline;
pub mod state;
pub mod transport;
pub mod window;

use alert::AlertSink;
use config::{AppConfig, ConfigError};
use inference::{load_model, InferenceDispatcher, InferenceError};
use pipeline::{DispatchContext, Pipeline, PipelineService, ServiceReport, TraceWriter};
use state::{DatasetWriter, DbError, FallEvent, SqliteFallStore, StorageError};
use transport::{MqttTransport, TransportError};

// Time allowed for the transport to flush the disconnect
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that end the process
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Model error: {0}")]
    Model(#[from] InferenceError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task failed: {0}")]
    Task(String),
}

/// Run the pipeline against the configured broker until quit, Ctrl-C or transport loss
pub async fn run(config: AppConfig) -> Result<ServiceReport, AppError> {
    config.validate()?;

    let db = state::init_db(config.storage.database_path.as_deref())?;
    let dataset_dir = match &config.storage.dataset_dir {
        Some(dir) => dir.clone(),
        None => state::storage::get_dataset_dir()?,
    };

    let classifier = match &config.inference.model_path {
        Some(path) => {
            let model = load_model(path)?;
            let dispatcher = InferenceDispatcher::new(
                model,
                config.inference.channels.clone(),
                config.inference.layout,
            );
            dispatcher.check_target(config.window.target)?;
            Some(Arc::new(dispatcher))
        }
        None => {
            log::info!("No model configured, collecting windows only");
            None
        }
    };

    let transport = MqttTransport::new(config.mqtt_settings());
    let handle = transport.handle();
    let sink = Arc::new(AlertSink::new(
        config.alert_policy(),
        Arc::new(transport.publisher()),
        Arc::new(SqliteFallStore::new(db.clone())),
    ));
    let trace = config
        .storage
        .trace_path
        .clone()
        .map(|path| Arc::new(TraceWriter::new(path)));

    let context = DispatchContext::new(
        classifier,
        sink,
        Some(DatasetWriter::new(dataset_dir, db)),
        trace,
        config.service_timings(),
    );
    let mut service = PipelineService::new(
        Pipeline::new(config.pipeline_settings(), config.decoder()),
        context,
    );

    let (tx, rx) = mpsc::channel(config.transport.channel_capacity);

    let mut transport_task = tokio::spawn(transport.run(tx.clone()));

    let operator_tx = tx;
    std::thread::Builder::new()
        .name("operator-input".to_string())
        .spawn(move || {
            log::info!("{}", commands::HELP);
            if let Err(e) = commands::read_operator_commands(std::io::stdin().lock(), operator_tx) {
                log::warn!("Operator input closed: {}", e);
            }
        })?;

    let mut transport_result: Option<Result<(), AppError>> = None;
    let shutdown = async {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    log::warn!("Ctrl-C handler unavailable: {}", e);
                    std::future::pending::<()>().await;
                }
                log::info!("Ctrl-C received");
            }
            joined = &mut transport_task => {
                transport_result = Some(match joined {
                    Ok(result) => result.map_err(AppError::from),
                    Err(e) => Err(AppError::Task(e.to_string())),
                });
            }
        }
    };

    let report = service.run(rx, shutdown).await;

    match transport_result {
        Some(result) => result?,
        None => {
            handle.disconnect().await;
            match tokio::time::timeout(DISCONNECT_TIMEOUT, transport_task).await {
                Ok(Ok(Err(e))) => log::warn!("Transport ended with error: {}", e),
                Ok(Err(e)) => log::warn!("Transport task failed: {}", e),
                Err(_) => log::warn!("Transport did not stop within {:?}", DISCONNECT_TIMEOUT),
                Ok(Ok(Ok(()))) => {}
            }
        }
    }

    Ok(report)
}

/// Recorded fall events, newest first
pub fn list_events(
    database_path: Option<&Path>,
    device_id: Option<&str>,
    limit: usize,
) -> Result<Vec<FallEvent>, AppError> {
    let db = state::init_db(database_path)?;
    let events = match device_id {
        Some(device) => state::list_fall_events_for_device(&db, device, limit)?,
        None => state::list_fall_events(&db, limit)?,
    };
    Ok(events)
}
