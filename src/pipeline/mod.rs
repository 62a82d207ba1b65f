// Pipeline module
// Per-device windowing core, the async event loop around it, and dispatch tracing

pub mod engine;
pub mod service;
pub mod trace;

pub use engine::{
    ControlCommand, DispatchMode, Pipeline, PipelineEvent, PipelineSettings, ReadyWindow,
    WindowSource,
};
pub use service::{DispatchContext, DispatchOutcome, PipelineService, ServiceReport, ServiceTimings};
pub use trace::{read_trace_file, TraceBuilder, TraceEntry, TraceError, TraceStage, TraceWriter};
