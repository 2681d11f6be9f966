//! Kafka client configuration built from the sink section

use rdkafka::config::ClientConfig;
use std::collections::HashMap;
use std::time::Duration;
use twincdc_shared::KafkaSinkConfig;

const CLIENT_ID_PREFIX: &str = "twincdc";

/// Producer defaults applied before the user supplied properties.
pub fn default_producer_properties() -> HashMap<String, String> {
    let mut properties = HashMap::new();
    properties.insert("acks".to_string(), "all".to_string());
    properties.insert("enable.idempotence".to_string(), "true".to_string());
    properties.insert("compression.type".to_string(), "snappy".to_string());
    properties.insert("linger.ms".to_string(), "5".to_string());
    properties.insert("max.in.flight.requests.per.connection".to_string(), "5".to_string());
    properties
}

/// Build the librdkafka configuration for one sink.
///
/// When SASL credentials are present the client uses `SASL_SSL` with the
/// `PLAIN` mechanism, which is what Event Hubs' Kafka endpoint expects.
/// Explicit `properties` always win.
pub fn client_config(config: &KafkaSinkConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", &config.brokers);
    client_config.set("client.id", format!("{}-{}", CLIENT_ID_PREFIX, config.name));
    client_config.set("message.timeout.ms", config.message_timeout_ms.to_string());

    for (key, value) in default_producer_properties() {
        client_config.set(key, value);
    }

    if let (Some(username), Some(password)) = (&config.sasl_username, &config.sasl_password) {
        client_config.set("security.protocol", "SASL_SSL");
        client_config.set("sasl.mechanisms", "PLAIN");
        client_config.set("sasl.username", username);
        client_config.set("sasl.password", password);
        // Event Hubs rejects idempotent producers
        client_config.set("enable.idempotence", "false");
    }

    for (key, value) in &config.properties {
        client_config.set(key, value);
    }

    client_config
}

pub fn send_timeout(config: &KafkaSinkConfig) -> Duration {
    Duration::from_millis(config.message_timeout_ms.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink_config() -> KafkaSinkConfig {
        KafkaSinkConfig {
            name: "stream".to_string(),
            enabled: true,
            brokers: "localhost:9092".to_string(),
            topic: "twin-events".to_string(),
            sasl_username: None,
            sasl_password: None,
            message_timeout_ms: 30_000,
            properties: HashMap::new(),
        }
    }

    #[test]
    fn test_plain_client_config() {
        let config = client_config(&sink_config());

        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(config.get("client.id"), Some("twincdc-stream"));
        assert_eq!(config.get("acks"), Some("all"));
        assert_eq!(config.get("security.protocol"), None);
    }

    #[test]
    fn test_sasl_client_config() {
        let mut sink = sink_config();
        sink.sasl_username = Some("$ConnectionString".to_string());
        sink.sasl_password = Some("Endpoint=sb://ns.servicebus.windows.net/".to_string());
        sink.properties.insert("linger.ms".to_string(), "50".to_string());

        let config = client_config(&sink);
        assert_eq!(config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(config.get("sasl.mechanisms"), Some("PLAIN"));
        assert_eq!(config.get("sasl.username"), Some("$ConnectionString"));
        assert_eq!(config.get("enable.idempotence"), Some("false"));
        assert_eq!(config.get("linger.ms"), Some("50"));
    }

    #[test]
    fn test_send_timeout() {
        assert_eq!(send_timeout(&sink_config()), Duration::from_secs(30));
    }
}
