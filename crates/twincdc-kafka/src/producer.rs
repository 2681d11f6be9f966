//! Kafka producer wrapper

use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{info, instrument};
use twincdc_core::{Result, TwinCdcError};

/// Thin wrapper over `FutureProducer` that maps errors into the crate error.
pub struct EventProducer {
    producer: FutureProducer,
}

impl EventProducer {
    #[instrument(skip(client_config))]
    pub fn new(client_config: &ClientConfig) -> Result<Self> {
        info!("Creating Kafka producer");

        let producer: FutureProducer = client_config
            .create()
            .map_err(|e| TwinCdcError::KafkaError(format!("Failed to create producer: {}", e)))?;

        Ok(Self { producer })
    }

    /// Send a message with headers; returns the partition and offset.
    pub async fn send_with_headers(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
        headers: &[(&str, &[u8])],
        timeout: Duration,
    ) -> Result<(i32, i64)> {
        let mut owned = OwnedHeaders::new_with_capacity(headers.len());
        for (header_key, header_value) in headers {
            owned = owned.insert(Header {
                key: *header_key,
                value: Some(*header_value),
            });
        }

        let mut record = FutureRecord::to(topic).payload(payload).headers(owned);
        if let Some(k) = key {
            record = record.key(k);
        }

        self.producer
            .send(record, Timeout::After(timeout))
            .await
            .map_err(|(kafka_error, _record)| TwinCdcError::KafkaError(format!("Send failed: {}", kafka_error)))
    }

    /// Flush pending messages
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|e| TwinCdcError::KafkaError(format!("Flush failed: {}", e)))
    }

    pub fn in_flight_count(&self) -> i32 {
        self.producer.in_flight_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_producer_creation_without_broker() {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", "localhost:9092");

        // librdkafka connects lazily, so creation succeeds offline
        let producer = EventProducer::new(&config).unwrap();
        assert_eq!(producer.in_flight_count(), 0);
    }
}
