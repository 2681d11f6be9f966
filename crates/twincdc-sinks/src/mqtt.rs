//! MQTT sink built on rumqttc

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use twincdc_core::{CloudEvent, EventSink, Result, TwinCdcError};
use twincdc_shared::{EventMetrics, MqttSinkConfig};

const REQUEST_CAPACITY: usize = 100;
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub fn qos_from_level(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(TwinCdcError::ConfigError(format!("Invalid MQTT QoS level {}", other))),
    }
}

/// Publishes each event to the configured topic. The rumqttc event loop runs
/// on its own task and drives the connection flag.
pub struct MqttSink {
    name: String,
    topic: String,
    qos: QoS,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSink {
    /// Must be called inside a runtime.
    pub fn new(config: &MqttSinkConfig) -> Result<Self> {
        if config.topic.is_empty() {
            return Err(TwinCdcError::ConfigError(format!("MQTT sink '{}' has no topic", config.name)));
        }
        let qos = qos_from_level(config.qos)?;

        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.max(5)));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(drive_event_loop(config.name.clone(), event_loop, connected.clone()));

        info!(sink = %config.name, host = %config.host, port = config.port, topic = %config.topic, "MQTT sink created");

        Ok(Self {
            name: config.name.clone(),
            topic: config.topic.clone(),
            qos,
            client,
            connected,
            event_loop: Mutex::new(Some(handle)),
        })
    }
}

async fn drive_event_loop(sink: String, mut event_loop: EventLoop, connected: Arc<AtomicBool>) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(sink = %sink, "MQTT connected");
                connected.store(true, Ordering::SeqCst);
                EventMetrics::sink_health(&sink, true);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                connected.store(false, Ordering::SeqCst);
                EventMetrics::sink_health(&sink, false);
            }
            Ok(_) => {}
            Err(e) => {
                if connected.swap(false, Ordering::SeqCst) {
                    warn!(sink = %sink, error = %e, "MQTT connection lost");
                } else {
                    debug!(sink = %sink, error = %e, "MQTT connection attempt failed");
                }
                EventMetrics::sink_health(&sink, false);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[async_trait]
impl EventSink for MqttSink {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, events), fields(sink = %self.name, topic = %self.topic, count = events.len()))]
    async fn send(&self, events: &[CloudEvent]) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TwinCdcError::MqttError(format!("{} is not connected", self.name)));
        }

        for (index, event) in events.iter().enumerate() {
            let payload = serde_json::to_vec(event).map_err(|e| TwinCdcError::after_delivered(index, e.into()))?;
            tokio::time::timeout(
                PUBLISH_TIMEOUT,
                self.client.publish(self.topic.as_str(), self.qos, false, payload),
            )
            .await
            .map_err(|_| TwinCdcError::MqttError("Publish timed out".to_string()))
            .and_then(|published| {
                published.map_err(|e| TwinCdcError::MqttError(format!("Publish failed: {}", e)))
            })
            .map_err(|e| TwinCdcError::after_delivered(index, e))?;
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) -> Result<()> {
        if let Err(e) = self.client.disconnect().await {
            debug!(sink = %self.name, error = %e, "MQTT disconnect failed");
        }
        if let Some(handle) = self.event_loop.lock().await.take() {
            handle.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn config(host: &str, port: u16) -> MqttSinkConfig {
        MqttSinkConfig {
            name: "mqtt".to_string(),
            enabled: true,
            host: host.to_string(),
            port,
            topic: "twins/events".to_string(),
            client_id: "twincdc-test".to_string(),
            username: None,
            password: None,
            qos: 1,
            keep_alive_seconds: 30,
        }
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(qos_from_level(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from_level(2).unwrap(), QoS::ExactlyOnce);
        assert!(qos_from_level(3).is_err());
    }

    #[tokio::test]
    async fn test_send_fails_while_disconnected() {
        let sink = MqttSink::new(&config("127.0.0.1", 1)).unwrap();
        let event = CloudEvent::new("src", "type", "subject", Utc::now(), json!({}));

        assert!(matches!(sink.send(&[event]).await, Err(TwinCdcError::MqttError(_))));
        assert!(!sink.is_healthy());
        sink.shutdown().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires an MQTT broker on localhost:1883
    async fn test_publish_to_local_broker() {
        let sink = MqttSink::new(&config("localhost", 1883)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(sink.is_healthy());

        let event = CloudEvent::new("src", "type", "subject", Utc::now(), json!({"k": 1}));
        sink.send(&[event]).await.unwrap();
        sink.shutdown().await.unwrap();
    }
}
