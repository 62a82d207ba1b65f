// MQTT transport
// Feeds broker publishes into the pipeline channel and publishes alerts back

use chrono::Utc;
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::alert::{Publisher, SinkError};
use crate::pipeline::PipelineEvent;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("MQTT client error: {0}")]
    Client(#[from] ClientError),

    #[error("Connection to {host}:{port} lost after {attempts} attempts: {message}")]
    ConnectionLost {
        host: String,
        port: u16,
        attempts: u32,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub subscribe_topic: String,
    pub keep_alive: Duration,

    /// Consecutive connection failures tolerated before giving up
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,

    /// Outgoing request queue size
    pub request_capacity: usize,
}

impl Default for MqttSettings {
    fn default() -> Self {
        MqttSettings {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "fallwatch".to_string(),
            subscribe_topic: "fall-detection/sensor/gyro".to_string(),
            keep_alive: Duration::from_secs(60),
            max_reconnect_attempts: 10,
            reconnect_delay: Duration::from_secs(2),
            request_capacity: 64,
        }
    }
}

pub struct MqttTransport {
    client: AsyncClient,
    eventloop: EventLoop,
    settings: MqttSettings,
}

impl MqttTransport {
    /// Build the client; nothing touches the network until `run` polls
    pub fn new(settings: MqttSettings) -> Self {
        let mut options = MqttOptions::new(
            settings.client_id.clone(),
            settings.host.clone(),
            settings.port,
        );
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, settings.request_capacity.max(1));
        MqttTransport {
            client,
            eventloop,
            settings,
        }
    }

    pub fn publisher(&self) -> MqttPublisher {
        MqttPublisher {
            client: self.client.clone(),
        }
    }

    /// Handle for disconnecting once the pipeline has stopped
    pub fn handle(&self) -> MqttHandle {
        MqttHandle {
            client: self.client.clone(),
        }
    }

    /// Poll the broker until disconnected, the pipeline goes away, or reconnects run out
    pub async fn run(mut self, events: mpsc::Sender<PipelineEvent>) -> Result<(), TransportError> {
        let topic = self.settings.subscribe_topic.clone();
        let mut failures: u32 = 0;

        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    failures = 0;
                    log::info!(
                        "Connected to {}:{} ({:?}), subscribing to {}",
                        self.settings.host,
                        self.settings.port,
                        ack.code,
                        topic
                    );
                    // try_subscribe: awaiting here would stall the event loop on a full queue
                    self.client.try_subscribe(topic.as_str(), QoS::AtMostOnce)?;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let event = PipelineEvent::Payload {
                        bytes: publish.payload.to_vec(),
                        received_at: Utc::now(),
                    };
                    if events.send(event).await.is_err() {
                        log::info!("Pipeline closed, transport stopping");
                        return Ok(());
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    log::debug!("Subscription acknowledged: {:?}", ack.return_codes);
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    log::info!("Disconnected from {}:{}", self.settings.host, self.settings.port);
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    failures += 1;
                    if failures > self.settings.max_reconnect_attempts {
                        return Err(TransportError::ConnectionLost {
                            host: self.settings.host.clone(),
                            port: self.settings.port,
                            attempts: failures,
                            message: e.to_string(),
                        });
                    }
                    log::warn!(
                        "Connection to {}:{} failed ({}/{}): {}, retrying in {:?}",
                        self.settings.host,
                        self.settings.port,
                        failures,
                        self.settings.max_reconnect_attempts,
                        e,
                        self.settings.reconnect_delay
                    );
                    tokio::time::sleep(self.settings.reconnect_delay).await;
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct MqttHandle {
    client: AsyncClient,
}

impl MqttHandle {
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            log::warn!("MQTT disconnect failed: {}", e);
        }
    }
}

/// Alert publisher; enqueues without waiting on the network
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl Publisher for MqttPublisher {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), SinkError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .map_err(|e| SinkError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_settings() -> MqttSettings {
        MqttSettings {
            host: "127.0.0.1".to_string(),
            // Nothing listens on the discard port in test environments
            port: 9,
            max_reconnect_attempts: 2,
            reconnect_delay: Duration::from_millis(10),
            request_capacity: 1,
            ..MqttSettings::default()
        }
    }

    #[test]
    fn test_default_settings() {
        let settings = MqttSettings::default();
        assert_eq!(settings.port, 1883);
        assert_eq!(settings.subscribe_topic, "fall-detection/sensor/gyro");
        assert_eq!(settings.keep_alive, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_publisher_enqueues_without_connection() {
        let transport = MqttTransport::new(unreachable_settings());
        let publisher = transport.publisher();

        assert!(publisher.publish("fall-detection/alert", b"Fall detected").is_ok());

        // Request queue holds one entry and nothing drains it
        match publisher.publish("fall-detection/alert", b"Fall detected") {
            Err(SinkError::Publish { topic, .. }) => assert_eq!(topic, "fall-detection/alert"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_gives_up_after_reconnect_limit() {
        let transport = MqttTransport::new(unreachable_settings());
        let (tx, _rx) = mpsc::channel(4);

        let result = tokio::time::timeout(Duration::from_secs(10), transport.run(tx))
            .await
            .expect("transport kept retrying");

        match result {
            Err(TransportError::ConnectionLost { attempts, port, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(port, 9);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
