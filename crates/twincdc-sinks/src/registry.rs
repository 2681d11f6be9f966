//! Builds the factory, routes and wrapped sinks from configuration

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use twincdc_core::{
    DeadLetterStore, EventFactory, EventFamily, EventRoute, EventSink, Result, SinkEventType, TwinCdcError,
};
use twincdc_kafka::KafkaSink;
use twincdc_shared::{exponential_backoff, EventsConfig, TwinCdcConfig};

use crate::{KustoSink, MqttSink, PostgresDeadLetterStore, ResilientSink, WebhookSink};

fn parse_overrides(overrides: &HashMap<String, String>) -> Result<HashMap<SinkEventType, String>> {
    overrides
        .iter()
        .map(|(kind, event_type)| Ok((SinkEventType::from_str(kind)?, event_type.clone())))
        .collect()
}

pub fn event_factory(events: &EventsConfig) -> Result<EventFactory> {
    Ok(EventFactory::new(&events.source_uri)
        .with_type_prefix(&events.type_prefix)
        .with_type_overrides(parse_overrides(&events.type_overrides)?))
}

pub fn event_routes(events: &EventsConfig) -> Result<Vec<EventRoute>> {
    events
        .routes
        .iter()
        .map(|route| {
            let types = route
                .event_types
                .iter()
                .map(|t| SinkEventType::from_str(t))
                .collect::<Result<Vec<_>>>()?;
            let mut built = EventRoute::new(&route.sink, types);
            built.type_overrides = parse_overrides(&route.type_overrides)?;
            Ok(built)
        })
        .collect()
}

pub fn enabled_families(events: &EventsConfig) -> HashSet<EventFamily> {
    let mut families = HashSet::new();
    if events.families.notification {
        families.insert(EventFamily::Notification);
    }
    if events.families.data_history {
        families.insert(EventFamily::DataHistory);
    }
    if events.families.telemetry {
        families.insert(EventFamily::Telemetry);
    }
    families
}

/// Dead-letter store, or `None` when dead-lettering is disabled.
pub fn dead_letter_store(config: &TwinCdcConfig) -> Result<Option<Arc<dyn DeadLetterStore>>> {
    if !config.dead_letter.enabled {
        return Ok(None);
    }
    let store = PostgresDeadLetterStore::connect_lazy(config.dead_letter_url(), &config.dead_letter)?;
    Ok(Some(Arc::new(store)))
}

/// Create every enabled sink, each wrapped with retries and dead-lettering.
pub fn build_sinks(
    config: &TwinCdcConfig,
    factory: &EventFactory,
    routes: &[EventRoute],
    dead_letters: Option<Arc<dyn DeadLetterStore>>,
) -> Result<Vec<Arc<dyn EventSink>>> {
    let mut raw: Vec<Arc<dyn EventSink>> = Vec::new();

    for kafka in config.sinks.kafka.iter().filter(|s| s.enabled) {
        raw.push(Arc::new(KafkaSink::new(kafka)?));
    }
    for kusto in config.sinks.kusto.iter().filter(|s| s.enabled) {
        let route = routes.iter().find(|r| r.sink_name == kusto.name);
        let type_for = |kind: SinkEventType| {
            route
                .and_then(|r| r.type_overrides.get(&kind).cloned())
                .unwrap_or_else(|| factory.type_string(kind))
        };
        raw.push(Arc::new(KustoSink::new(kusto, type_for)?));
    }
    for mqtt in config.sinks.mqtt.iter().filter(|s| s.enabled) {
        raw.push(Arc::new(MqttSink::new(mqtt)?));
    }
    for webhook in config.sinks.webhooks.iter().filter(|s| s.enabled) {
        raw.push(Arc::new(WebhookSink::new(webhook)?));
    }

    let mut names = HashSet::new();
    if let Some(duplicate) = raw.iter().find(|s| !names.insert(s.name().to_string())) {
        return Err(TwinCdcError::ConfigError(format!("Duplicate sink name '{}'", duplicate.name())));
    }

    info!(count = raw.len(), dead_letter = dead_letters.is_some(), "Sinks configured");

    Ok(raw
        .into_iter()
        .map(|inner| {
            Arc::new(ResilientSink::new(
                inner,
                exponential_backoff(config.retry.clone()),
                dead_letters.clone(),
            )) as Arc<dyn EventSink>
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use twincdc_shared::{RouteConfig, WebhookSinkConfig};

    #[test]
    fn test_routes_from_config() {
        let mut config = TwinCdcConfig::default();
        let mut overrides = HashMap::new();
        overrides.insert("PropertyEvent".to_string(), "custom.property".to_string());
        config.events.routes.push(RouteConfig {
            sink: "adx".to_string(),
            event_types: vec!["PropertyEvent".to_string(), "twin_lifecycle".to_string()],
            type_overrides: overrides,
        });

        let routes = event_routes(&config.events).unwrap();
        assert_eq!(routes.len(), 1);
        assert!(routes[0].accepts(SinkEventType::TwinLifecycle));
        assert!(!routes[0].accepts(SinkEventType::TwinCreate));
        assert_eq!(
            routes[0].type_overrides.get(&SinkEventType::PropertyEvent).map(String::as_str),
            Some("custom.property")
        );
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let mut config = TwinCdcConfig::default();
        config.events.routes.push(RouteConfig {
            sink: "x".to_string(),
            event_types: vec!["NotAType".to_string()],
            type_overrides: HashMap::new(),
        });
        assert!(matches!(event_routes(&config.events), Err(TwinCdcError::ConfigError(_))));
    }

    #[test]
    fn test_factory_and_families() {
        let mut config = TwinCdcConfig::default();
        config.events.families.telemetry = false;
        config
            .events
            .type_overrides
            .insert("TwinCreate".to_string(), "twin.created".to_string());

        let factory = event_factory(&config.events).unwrap();
        assert_eq!(factory.type_string(SinkEventType::TwinCreate), "twin.created");
        assert_eq!(
            factory.type_string(SinkEventType::TwinUpdate),
            "Konnektr.DigitalTwins.Twin.Update"
        );

        let families = enabled_families(&config.events);
        assert!(families.contains(&EventFamily::Notification));
        assert!(!families.contains(&EventFamily::Telemetry));
    }

    #[tokio::test]
    async fn test_build_wrapped_sinks() {
        let mut config = TwinCdcConfig::default();
        config.dead_letter.enabled = false;
        config.sinks.webhooks.push(WebhookSinkConfig {
            name: "hook".to_string(),
            enabled: true,
            url: "http://localhost:8081/events".to_string(),
            auth: Default::default(),
            headers: HashMap::new(),
            timeout_seconds: 5,
        });
        config.sinks.webhooks.push(WebhookSinkConfig {
            name: "disabled".to_string(),
            enabled: false,
            url: "http://localhost:8082/events".to_string(),
            auth: Default::default(),
            headers: HashMap::new(),
            timeout_seconds: 5,
        });

        let factory = event_factory(&config.events).unwrap();
        let store = dead_letter_store(&config).unwrap();
        assert!(store.is_none());

        let sinks = build_sinks(&config, &factory, &[], store).unwrap();
        assert_eq!(sinks.len(), 1);
        assert_eq!(sinks[0].name(), "hook");
        assert!(sinks[0].is_healthy());
    }

    #[tokio::test]
    async fn test_duplicate_sink_names_rejected() {
        let mut config = TwinCdcConfig::default();
        for _ in 0..2 {
            config.sinks.webhooks.push(WebhookSinkConfig {
                name: "hook".to_string(),
                enabled: true,
                url: "http://localhost:8081/events".to_string(),
                auth: Default::default(),
                headers: HashMap::new(),
                timeout_seconds: 5,
            });
        }
        let factory = event_factory(&config.events).unwrap();
        assert!(build_sinks(&config, &factory, &[], None).is_err());
    }
}
