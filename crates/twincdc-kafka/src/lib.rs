//! Kafka (and Event Hubs Kafka endpoint) sink for twincdc
//!
//! Events are published in CloudEvents structured mode: the payload is the
//! JSON envelope, the key is the event subject so every change of one twin
//! lands on the same partition.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use twincdc_core::{CloudEvent, EventSink, Result, TwinCdcError, CLOUDEVENTS_CONTENT_TYPE};
use twincdc_shared::{EventMetrics, KafkaSinkConfig, PerfTimer};

pub mod config;
pub mod producer;

pub use config::*;
pub use producer::*;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct KafkaSink {
    name: String,
    topic: String,
    timeout: Duration,
    producer: EventProducer,
    healthy: AtomicBool,
}

impl KafkaSink {
    pub fn new(config: &KafkaSinkConfig) -> Result<Self> {
        if config.topic.is_empty() {
            return Err(TwinCdcError::ConfigError(format!("Kafka sink '{}' has no topic", config.name)));
        }
        let producer = EventProducer::new(&client_config(config))?;

        info!(
            sink = %config.name,
            brokers = %config.brokers,
            topic = %config.topic,
            "Kafka sink created"
        );

        Ok(Self {
            name: config.name.clone(),
            topic: config.topic.clone(),
            timeout: send_timeout(config),
            producer,
            healthy: AtomicBool::new(true),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Serialize an event for the wire: the key and the structured payload.
    pub fn encode(event: &CloudEvent) -> Result<(String, Vec<u8>)> {
        Ok((event.subject.clone(), serde_json::to_vec(event)?))
    }
}

#[async_trait]
impl EventSink for KafkaSink {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, events), fields(sink = %self.name, topic = %self.topic, count = events.len()))]
    async fn send(&self, events: &[CloudEvent]) -> Result<()> {
        let _timer = PerfTimer::new("twincdc_kafka_publish_duration_seconds").with_label("sink", &self.name);
        let headers: [(&str, &[u8]); 1] = [("content-type", CLOUDEVENTS_CONTENT_TYPE.as_bytes())];

        for (index, event) in events.iter().enumerate() {
            let (key, payload) = Self::encode(event).map_err(|e| TwinCdcError::after_delivered(index, e))?;
            match self
                .producer
                .send_with_headers(&self.topic, Some(&key), &payload, &headers, self.timeout)
                .await
            {
                Ok((partition, offset)) => {
                    debug!(event_id = %event.id, partition, offset, "Event published");
                }
                Err(e) => {
                    warn!(event_id = %event.id, error = %e, "Failed to publish event");
                    self.healthy.store(false, Ordering::SeqCst);
                    EventMetrics::sink_health(&self.name, false);
                    return Err(TwinCdcError::after_delivered(index, e));
                }
            }
        }

        self.healthy.store(true, Ordering::SeqCst);
        EventMetrics::sink_health(&self.name, true);
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) -> Result<()> {
        info!(sink = %self.name, in_flight = self.producer.in_flight_count(), "Flushing Kafka producer");
        self.producer.flush(FLUSH_TIMEOUT)
    }
}
