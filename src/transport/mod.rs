// Transport module
// Publish/subscribe plumbing between the broker and the pipeline

pub mod mqtt;

pub use mqtt::{MqttHandle, MqttPublisher, MqttSettings, MqttTransport, TransportError};
