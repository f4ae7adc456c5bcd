// MQTT2Prom Exporter - MQTT transport
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! MQTT transport
//!
//! Connects to the broker, subscribes to the configured topic filter and
//! feeds every publication into the shared [`MessagePipeline`]. The event
//! loop reconnects with a fixed backoff; all message-level error handling
//! lives in the pipeline, not here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mqtt2prom::MessagePipeline;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

/// Delay before polling again after a connection error
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Broker connection settings
#[derive(Debug, Clone)]
pub struct MqttSettings {
    /// Broker host
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Client identifier presented to the broker
    pub client_id: String,
    /// Optional username
    pub username: Option<String>,
    /// Optional password
    pub password: Option<String>,
    /// Keepalive interval in seconds
    pub keepalive_secs: u64,
    /// Topic filter to subscribe to
    pub subscribe_topic: String,
    /// CA certificate path; enables TLS towards the broker when set
    pub tls_ca_path: Option<String>,
}

/// Connection state shared with the HTTP handlers
pub struct MqttStatus {
    connected: AtomicBool,
    broker: String,
}

impl MqttStatus {
    /// Create a disconnected status for the given broker address
    pub fn new(broker: String) -> Self {
        Self {
            connected: AtomicBool::new(false),
            broker,
        }
    }

    /// Whether the broker connection is currently established
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Broker address, for status reporting
    pub fn broker(&self) -> &str {
        &self.broker
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

/// Run the MQTT event loop until the process exits
///
/// Subscription happens on every ConnAck so it survives reconnects.
pub async fn run(
    settings: MqttSettings,
    pipeline: Arc<RwLock<MessagePipeline>>,
    status: Arc<MqttStatus>,
) {
    let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    options.set_keep_alive(Duration::from_secs(settings.keepalive_secs));

    if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
        options.set_credentials(username, password);
    }

    if let Some(path) = &settings.tls_ca_path {
        let ca = match std::fs::read(path) {
            Ok(ca) => ca,
            Err(e) => {
                error!("cannot read CA certificate '{path}': {e}");
                return;
            }
        };
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: None,
        }));
    }

    let (client, mut eventloop) = AsyncClient::new(options, 64);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(broker = %status.broker(), "MQTT connection acknowledged");
                status.set_connected(true);

                info!(topic = %settings.subscribe_topic, "subscribing");
                if let Err(e) = client
                    .subscribe(&settings.subscribe_topic, QoS::AtMostOnce)
                    .await
                {
                    error!("subscribe failed: {e}");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    topic = %publish.topic,
                    bytes = publish.payload.len(),
                    "message received"
                );
                let mut pipeline = pipeline.write().await;
                pipeline.handle_message(&publish.topic, &publish.payload, &[]);
            }
            Ok(_) => {}
            Err(e) => {
                status.set_connected(false);
                error!(
                    "MQTT connection error: {e}, retrying in {}s",
                    RECONNECT_DELAY.as_secs()
                );
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_starts_disconnected() {
        let status = MqttStatus::new("127.0.0.1:1883".to_string());
        assert!(!status.is_connected());
        assert_eq!(status.broker(), "127.0.0.1:1883");
    }

    #[test]
    fn test_status_toggles() {
        let status = MqttStatus::new("broker:1883".to_string());
        status.set_connected(true);
        assert!(status.is_connected());
        status.set_connected(false);
        assert!(!status.is_connected());
    }
}
