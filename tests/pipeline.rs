// End-to-end: payload decode through alert persistence
use chrono::Utc;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

use fallwatch_lib::alert::{AlertPolicy, AlertSink, Publisher, SinkError};
use fallwatch_lib::config::AppConfig;
use fallwatch_lib::inference::{load_model, InferenceDispatcher, InferenceError};
use fallwatch_lib::AppError;
use fallwatch_lib::pipeline::{
    read_trace_file, ControlCommand, DispatchContext, Pipeline, PipelineEvent, PipelineService,
    ServiceReport, TraceStage, TraceWriter,
};
use fallwatch_lib::state::{
    init_db, list_dataset_files, list_fall_events, DatasetWriter, DbConnection, SqliteFallStore,
};

#[derive(Default)]
struct RecordingPublisher {
    sent: Mutex<Vec<(String, String)>>,
}

impl Publisher for RecordingPublisher {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), SinkError> {
        self.sent
            .lock()
            .unwrap()
            .push((topic.to_string(), String::from_utf8_lossy(payload).to_string()));
        Ok(())
    }
}

struct Fixture {
    dir: TempDir,
    db: DbConnection,
    publisher: Arc<RecordingPublisher>,
    service: PipelineService,
}

// Linear model over a [1, 3, 25] gyro window: standing by default, forward fall
// once gyro_x is large
fn write_model(dir: &TempDir) -> std::path::PathBuf {
    let input_len = 3 * 25;
    let mut weights = vec![vec![0.0f32; input_len]; 5];
    for w in weights[2].iter_mut().take(25) {
        *w = 1.0;
    }
    let model = serde_json::json!({
        "backend": "linear",
        "input_shape": [1, 3, 25],
        "weights": weights,
        "bias": [1.0, 0.0, 0.0, 0.0, 0.0],
    });

    let path = dir.path().join("model.json");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(model.to_string().as_bytes()).unwrap();
    path
}

fn fixture(config_json: &str) -> Fixture {
    let dir = TempDir::new().unwrap();
    let mut config: AppConfig = serde_json::from_str(config_json).unwrap();
    config.inference.model_path = Some(write_model(&dir));
    config.storage.database_path = Some(dir.path().join("events.db"));
    config.storage.dataset_dir = Some(dir.path().join("datasets"));
    config.storage.trace_path = Some(dir.path().join("trace.jsonl"));
    config.validate().unwrap();

    let db = init_db(config.storage.database_path.as_deref()).unwrap();
    let model = load_model(config.inference.model_path.as_ref().unwrap()).unwrap();
    let classifier = Arc::new(InferenceDispatcher::new(
        model,
        config.inference.channels.clone(),
        config.inference.layout,
    ));

    let publisher = Arc::new(RecordingPublisher::default());
    let policy: AlertPolicy = config.alert_policy();
    let sink = Arc::new(AlertSink::new(
        policy,
        publisher.clone(),
        Arc::new(SqliteFallStore::new(db.clone())),
    ));

    let context = DispatchContext::new(
        Some(classifier),
        sink,
        Some(DatasetWriter::new(
            config.storage.dataset_dir.clone().unwrap(),
            db.clone(),
        )),
        Some(Arc::new(TraceWriter::new(
            config.storage.trace_path.clone().unwrap(),
        ))),
        config.service_timings(),
    );
    let pipeline = Pipeline::new(config.pipeline_settings(), config.decoder());

    Fixture {
        dir,
        db,
        publisher,
        service: PipelineService::new(pipeline, context),
    }
}

fn json_payload(device: &str, millis: i64, gyro_x: f64) -> PipelineEvent {
    PipelineEvent::Payload {
        bytes: format!(
            r#"{{"ID": "{}", "gyX": {}, "gyY": 0.1, "gyZ": -0.1, "temp": 32.0, "millis": {}}}"#,
            device, gyro_x, millis
        )
        .into_bytes(),
        received_at: Utc::now(),
    }
}

fn binary_payload(device: u8, gyro_x: f32) -> PipelineEvent {
    let mut bytes = vec![device];
    bytes.extend_from_slice(&gyro_x.to_le_bytes());
    bytes.extend_from_slice(&0.0f32.to_le_bytes());
    bytes.extend_from_slice(&0.0f32.to_le_bytes());
    PipelineEvent::Payload {
        bytes,
        received_at: Utc::now(),
    }
}

async fn run(fixture: &mut Fixture, events: Vec<PipelineEvent>) -> ServiceReport {
    let (tx, rx) = mpsc::channel(256);
    for event in events {
        tx.send(event).await.unwrap();
    }
    tx.send(PipelineEvent::Command(ControlCommand::Quit))
        .await
        .unwrap();

    tokio::time::timeout(
        Duration::from_secs(10),
        fixture.service.run(rx, std::future::pending()),
    )
    .await
    .expect("pipeline did not stop")
}

const LIVE_CONFIG: &str = r#"{
    "window": {"auto_start": true, "count_threshold": 25, "target": {"fixed": 25},
               "poll_interval_ms": 50}
}"#;

#[tokio::test]
async fn test_fall_stream_alerts_and_persists() {
    let mut f = fixture(LIVE_CONFIG);

    let events = (0..25).map(|i| json_payload("wrist", i * 50, 5.0)).collect();
    let report = run(&mut f, events).await;

    assert_eq!(report.windows, 1);
    assert_eq!(report.alerts.len(), 1);
    let alert = &report.alerts[0];
    assert_eq!(alert.device_id, "wrist");
    assert_eq!(alert.label, "fall_forward");
    assert!(alert.delivered && alert.persisted);

    let sent = f.publisher.sent.lock().unwrap().clone();
    assert_eq!(
        sent,
        vec![(
            "fall-detection/alert".to_string(),
            "Fall detected: forward fall".to_string()
        )]
    );

    let stored = list_fall_events(&f.db, 10).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].window_id, alert.window_id);
    assert_eq!(stored[0].class_index, 2);

    let trace = read_trace_file(&f.dir.path().join("trace.jsonl")).unwrap();
    let stages: Vec<TraceStage> = trace.iter().map(|e| e.stage).collect();
    assert_eq!(
        stages,
        vec![TraceStage::Resample, TraceStage::Classify, TraceStage::Alert]
    );
    assert_eq!(trace[0].start_ms, Some(0));
    assert_eq!(trace[0].end_ms, Some(24 * 50));
}

#[tokio::test]
async fn test_quiet_stream_is_not_alerted() {
    let mut f = fixture(LIVE_CONFIG);

    let events = (0..50).map(|i| json_payload("wrist", i * 50, 0.0)).collect();
    let report = run(&mut f, events).await;

    assert_eq!(report.windows, 2);
    assert_eq!(report.classified, 2);
    assert!(report.alerts.is_empty());
    assert!(f.publisher.sent.lock().unwrap().is_empty());
    assert!(list_fall_events(&f.db, 10).unwrap().is_empty());
}

#[tokio::test]
async fn test_binary_frames_from_two_devices() {
    let mut f = fixture(LIVE_CONFIG);

    let mut events = Vec::new();
    for _ in 0..25 {
        events.push(binary_payload(b'A', 4.0));
        events.push(binary_payload(b'B', 0.0));
    }
    // Garbage between frames is dropped without disturbing either device
    events.push(PipelineEvent::Payload {
        bytes: vec![0x00; 7],
        received_at: Utc::now(),
    });
    let report = run(&mut f, events).await;

    assert_eq!(report.windows, 2);
    assert_eq!(report.alerts.len(), 1);
    assert_eq!(report.alerts[0].device_id, "A");
}

#[tokio::test]
async fn test_labeled_collection_writes_upsampled_dataset() {
    let mut f = fixture(
        r#"{
            "window": {"count_threshold": 20, "after_drain": "idle",
                       "target": {"scaled": {"source_hz": 20.0, "target_hz": 100.0}}}
        }"#,
    );

    let mut events = vec![PipelineEvent::Command(ControlCommand::Start {
        device: None,
        label: Some(2),
    })];
    events.extend((0..20).map(|i| json_payload("wrist", i * 50, 0.0)));
    let report = run(&mut f, events).await;

    // The upsampled window no longer matches the 25-point model input
    assert_eq!(report.windows, 1);
    assert_eq!(report.dropped, 1);

    let files = list_dataset_files(&f.db, Some(2)).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].records, 100);
    assert!(files[0].path.contains("dataset_label_2_wrist_"));
}

#[tokio::test]
async fn test_mismatched_model_stops_startup() {
    let dir = TempDir::new().unwrap();
    let model_path = write_model(&dir);

    let mut config = AppConfig::default();
    config.inference.model_path = Some(model_path);
    config.storage.database_path = Some(dir.path().join("events.db"));
    config.storage.dataset_dir = Some(dir.path().join("datasets"));
    // The model takes 25-point windows
    config.window.target = fallwatch_lib::window::TargetLength::Fixed(50);

    let result = fallwatch_lib::run(config.clone()).await;
    assert!(matches!(
        result,
        Err(AppError::Model(InferenceError::ShapeMismatch { .. }))
    ));

    let three_classes = dir.path().join("three.json");
    std::fs::write(
        &three_classes,
        r#"{"backend": "linear", "input_shape": [1, 3, 1],
            "weights": [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            "bias": [0.0, 0.0, 0.0]}"#,
    )
    .unwrap();
    config.inference.model_path = Some(three_classes);
    config.window.target = fallwatch_lib::window::TargetLength::Fixed(25);

    let result = fallwatch_lib::run(config).await;
    assert!(matches!(
        result,
        Err(AppError::Model(InferenceError::ModelLoad(_)))
    ));
}
