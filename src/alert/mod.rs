// Alert module
// Fall notifications and their durable record

pub mod sink;

pub use sink::{AlertEvent, AlertPolicy, AlertSink, FallEventStore, Publisher, SinkError};
