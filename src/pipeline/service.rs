// Pipeline event loop
// Serializes ingestion, commands and ticks on one task; classification and alerting run on the blocking pool

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use super::engine::{ControlCommand, Pipeline, PipelineEvent, ReadyWindow, WindowSource};
use super::trace::{TraceBuilder, TraceStage, TraceWriter};
use crate::alert::{AlertEvent, AlertSink, SinkError};
use crate::inference::{ClassificationResult, InferenceDispatcher, InferenceError};
use crate::state::DatasetWriter;

#[derive(Debug, Clone)]
pub struct ServiceTimings {
    pub poll_interval: Duration,
    pub inference_timeout: Duration,
    pub sink_timeout: Duration,
    pub max_in_flight: usize,
    pub shutdown_grace: Duration,
}

impl Default for ServiceTimings {
    fn default() -> Self {
        ServiceTimings {
            poll_interval: Duration::from_millis(500),
            inference_timeout: Duration::from_secs(2),
            sink_timeout: Duration::from_secs(2),
            max_in_flight: 4,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// What happened to one window after it left the pipeline
#[derive(Debug)]
pub enum DispatchOutcome {
    /// No classifier configured; the window was only collected
    Collected,
    Dropped,
    Classified(ClassificationResult),
    Alerted(AlertEvent),
    /// Fall class whose sink call outlived its timeout
    AlertUnconfirmed(ClassificationResult),
}

/// Totals for one service run
#[derive(Debug, Default)]
pub struct ServiceReport {
    pub windows: usize,
    pub classified: usize,
    pub dropped: usize,
    pub alerts: Vec<AlertEvent>,
    /// Fall windows whose alert was still in the sink when it timed out
    pub unconfirmed_alerts: usize,
    /// Dispatches still running when the grace period ran out
    pub abandoned: usize,
}

impl ServiceReport {
    fn absorb(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Collected => {}
            DispatchOutcome::Dropped => self.dropped += 1,
            DispatchOutcome::Classified(_) => self.classified += 1,
            DispatchOutcome::Alerted(event) => {
                self.classified += 1;
                self.alerts.push(event);
            }
            DispatchOutcome::AlertUnconfirmed(_) => {
                self.classified += 1;
                self.unconfirmed_alerts += 1;
            }
        }
    }
}

/// Shared collaborators of every window dispatch
pub struct DispatchContext {
    pub classifier: Option<Arc<InferenceDispatcher>>,
    pub sink: Arc<AlertSink>,
    pub dataset: Option<DatasetWriter>,
    pub trace: Option<Arc<TraceWriter>>,
    permits: Arc<Semaphore>,
    timings: ServiceTimings,
}

impl DispatchContext {
    pub fn new(
        classifier: Option<Arc<InferenceDispatcher>>,
        sink: Arc<AlertSink>,
        dataset: Option<DatasetWriter>,
        trace: Option<Arc<TraceWriter>>,
        timings: ServiceTimings,
    ) -> Self {
        DispatchContext {
            classifier,
            sink,
            dataset,
            trace,
            permits: Arc::new(Semaphore::new(timings.max_in_flight.max(1))),
            timings,
        }
    }

    fn trace(&self, entry: super::trace::TraceEntry) {
        if let Some(trace) = &self.trace {
            trace.record(entry);
        }
    }

    /// Dataset output, classification and alerting for one window
    pub async fn dispatch(self: Arc<Self>, ready: ReadyWindow) -> DispatchOutcome {
        let ReadyWindow {
            window,
            source,
            session_id,
            dataset_index,
            ready_at,
        } = ready;
        let window = Arc::new(window);

        self.trace(
            TraceBuilder::stage(TraceStage::Resample, window.device_id.as_str())
                .window(&window)
                .data(serde_json::json!({
                    "source": source,
                    "session_id": session_id,
                    "source_len": window.source_len,
                    "len": window.len(),
                }))
                .message(format!(
                    "Resampled {} samples to {}",
                    window.source_len,
                    window.len()
                )),
        );

        if let (Some(writer), Some(index)) = (self.dataset.clone(), dataset_index) {
            let w = Arc::clone(&window);
            let written = tokio::time::timeout(
                self.timings.sink_timeout,
                tokio::task::spawn_blocking(move || writer.write(&w, index, ready_at)),
            )
            .await;

            match written {
                Ok(Ok(Ok(Some(file)))) => self.trace(
                    TraceBuilder::stage(TraceStage::Dataset, window.device_id.as_str())
                        .window(&window)
                        .data(serde_json::json!({"path": file.path, "sha256": file.sha256}))
                        .message(format!("Saved {} records", file.records)),
                ),
                Ok(Ok(Ok(None))) => {}
                Ok(Ok(Err(e))) => log::error!(
                    "Dataset write for window {} (device {}) failed: {}",
                    window.id,
                    window.device_id,
                    e
                ),
                Ok(Err(join_err)) => log::error!("Dataset writer panicked: {}", join_err),
                Err(_) => log::error!(
                    "Dataset write for window {} (device {}) timed out after {:?}",
                    window.id,
                    window.device_id,
                    self.timings.sink_timeout
                ),
            }
        }

        let Some(classifier) = self.classifier.clone() else {
            return DispatchOutcome::Collected;
        };

        let result = match self.classify(classifier, Arc::clone(&window)).await {
            Ok(result) => result,
            Err(e) => {
                log::warn!(
                    "Dropped window {} from device {} ({}..{} ms): {}",
                    window.id,
                    window.device_id,
                    window.start_ms(),
                    window.end_ms(),
                    e
                );
                return DispatchOutcome::Dropped;
            }
        };

        self.trace(
            TraceBuilder::stage(TraceStage::Classify, window.device_id.as_str())
                .window(&window)
                .data(serde_json::json!({
                    "predicted_label": result.predicted_label,
                    "predicted_index": result.predicted_index,
                    "probabilities": result.probabilities,
                }))
                .message(format!(
                    "{} ({:.3})",
                    result.predicted_label, result.confidence
                )),
        );

        if !self.sink.is_fall(result.predicted_index) {
            return DispatchOutcome::Classified(result);
        }

        let sink = Arc::clone(&self.sink);
        let (w, r) = (Arc::clone(&window), result.clone());
        let dispatched = tokio::time::timeout(
            self.timings.sink_timeout,
            tokio::task::spawn_blocking(move || sink.dispatch(&w, &r, ready_at)),
        )
        .await;

        match dispatched {
            Ok(Ok(Some(event))) => {
                self.trace(
                    TraceBuilder::stage(TraceStage::Alert, window.device_id.as_str())
                        .window(&window)
                        .data(serde_json::json!({
                            "event_id": event.id,
                            "delivered": event.delivered,
                            "persisted": event.persisted,
                        }))
                        .message(format!("Fall alert: {}", event.label)),
                );
                DispatchOutcome::Alerted(event)
            }
            Ok(Ok(None)) => DispatchOutcome::Classified(result),
            Ok(Err(join_err)) => {
                log::error!("Alert sink panicked: {}", join_err);
                DispatchOutcome::Classified(result)
            }
            Err(_) => {
                // The blocking call keeps running and may still publish and persist
                let e = SinkError::Timeout {
                    operation: "alert dispatch",
                    limit: self.timings.sink_timeout,
                };
                log::error!(
                    "Alert for window {} (device {}) has unknown outcome, it may still be delivered: {}",
                    window.id,
                    window.device_id,
                    e
                );
                DispatchOutcome::AlertUnconfirmed(result)
            }
        }
    }

    // The permit travels with the blocking call, so a model that outlives the
    // timeout still counts against max_in_flight until it returns
    async fn classify(
        &self,
        classifier: Arc<InferenceDispatcher>,
        window: Arc<crate::window::Window>,
    ) -> Result<ClassificationResult, InferenceError> {
        let permits = Arc::clone(&self.permits);
        let limit = self.timings.inference_timeout;

        let run = async move {
            let permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => return Err(InferenceError::Model(e.to_string())),
            };

            let task = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                classifier.classify(&window)
            });

            match task.await {
                Ok(result) => result,
                Err(join_err) => Err(InferenceError::Model(format!(
                    "classifier panicked: {}",
                    join_err
                ))),
            }
        };

        match tokio::time::timeout(limit, run).await {
            Ok(result) => result,
            Err(_) => Err(InferenceError::Timeout(limit)),
        }
    }
}

/// Owns the pipeline for the lifetime of one run
pub struct PipelineService {
    pipeline: Pipeline,
    context: Arc<DispatchContext>,
}

impl PipelineService {
    pub fn new(pipeline: Pipeline, context: DispatchContext) -> Self {
        PipelineService {
            pipeline,
            context: Arc::new(context),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Run until quit, `shutdown` resolving, or the event channel closing
    ///
    /// On exit every device gets its stop action, and in-flight dispatches
    /// are awaited for up to the shutdown grace period.
    pub async fn run<F>(
        &mut self,
        mut events: mpsc::Receiver<PipelineEvent>,
        shutdown: F,
    ) -> ServiceReport
    where
        F: Future<Output = ()>,
    {
        let timings = self.context.timings.clone();
        let mut ticker = tokio::time::interval(timings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut tasks: JoinSet<DispatchOutcome> = JoinSet::new();
        let mut report = ServiceReport::default();
        tokio::pin!(shutdown);

        log::info!("Pipeline running ({:?} mode)", self.pipeline.settings().mode);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(PipelineEvent::Command(ControlCommand::Quit)) => {
                        log::info!("Quit requested");
                        break;
                    }
                    Some(event) => {
                        let ready = self.apply(event);
                        self.spawn(ready, &mut tasks, &mut report);
                    }
                    None => {
                        log::info!("Event channel closed");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    let ready = self.pipeline.tick(Utc::now());
                    self.spawn(ready, &mut tasks, &mut report);
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    Self::collect(joined, &mut report);
                }
                _ = &mut shutdown => {
                    log::info!("Shutdown signal received");
                    break;
                }
            }
        }

        let ready = self.pipeline.shutdown(Utc::now());
        self.spawn(ready, &mut tasks, &mut report);

        let grace = tokio::time::timeout(timings.shutdown_grace, async {
            while let Some(joined) = tasks.join_next().await {
                Self::collect(joined, &mut report);
            }
        })
        .await;

        if grace.is_err() {
            report.abandoned = tasks.len();
            log::warn!(
                "{} dispatches still running after {:?}, abandoned",
                report.abandoned,
                timings.shutdown_grace
            );
            tasks.abort_all();
        }

        log::info!(
            "Pipeline stopped: {} windows, {} classified, {} dropped, {} alerts ({} unconfirmed)",
            report.windows,
            report.classified,
            report.dropped,
            report.alerts.len(),
            report.unconfirmed_alerts
        );
        report
    }

    fn apply(&mut self, event: PipelineEvent) -> Vec<ReadyWindow> {
        let now = Utc::now();
        match event {
            PipelineEvent::Payload { bytes, received_at } => {
                self.pipeline.handle_payload(&bytes, received_at)
            }
            PipelineEvent::Sample(sample) => {
                self.pipeline.handle_sample(sample, now).into_iter().collect()
            }
            PipelineEvent::Command(ControlCommand::Start { device, label }) => {
                self.pipeline.start(device.as_deref(), label, now);
                Vec::new()
            }
            PipelineEvent::Command(ControlCommand::Stop { device }) => {
                self.pipeline.stop(device.as_deref(), now)
            }
            PipelineEvent::Command(ControlCommand::Quit) => Vec::new(),
        }
    }

    fn spawn(
        &self,
        ready: Vec<ReadyWindow>,
        tasks: &mut JoinSet<DispatchOutcome>,
        report: &mut ServiceReport,
    ) {
        for window in ready {
            report.windows += 1;
            if window.source == WindowSource::Snapshot {
                log::debug!(
                    "Snapshot of device {} ({} samples)",
                    window.window.device_id,
                    window.window.source_len
                );
            }
            let context = Arc::clone(&self.context);
            tasks.spawn(context.dispatch(window));
        }
    }

    fn collect(
        joined: Result<DispatchOutcome, tokio::task::JoinError>,
        report: &mut ServiceReport,
    ) {
        match joined {
            Ok(outcome) => report.absorb(outcome),
            Err(e) => {
                log::error!("Dispatch task failed: {}", e);
                report.dropped += 1;
            }
        }
    }
}
