//! Type-based routing of generated events to sinks

use std::collections::{HashMap, HashSet};

use crate::{EventFamily, GeneratedEvent, SinkEventType};

/// Subscription of one sink to a set of event types.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRoute {
    pub sink_name: String,
    pub event_types: HashSet<SinkEventType>,
    pub type_overrides: HashMap<SinkEventType, String>,
}

impl EventRoute {
    pub fn new(sink_name: impl Into<String>, event_types: impl IntoIterator<Item = SinkEventType>) -> Self {
        Self {
            sink_name: sink_name.into(),
            event_types: event_types.into_iter().collect(),
            type_overrides: HashMap::new(),
        }
    }

    /// Route that receives every event type.
    pub fn all(sink_name: impl Into<String>) -> Self {
        Self::new(sink_name, SinkEventType::ALL)
    }

    pub fn with_type_override(mut self, kind: SinkEventType, event_type: impl Into<String>) -> Self {
        self.type_overrides.insert(kind, event_type.into());
        self
    }

    pub fn accepts(&self, kind: SinkEventType) -> bool {
        self.event_types.contains(&kind)
    }

    /// Apply this route's type override, if any.
    pub fn prepare(&self, generated: &GeneratedEvent) -> crate::CloudEvent {
        match self.type_overrides.get(&generated.kind) {
            Some(custom) => generated.event.clone().with_type(custom.clone()),
            None => generated.event.clone(),
        }
    }
}

/// Immutable set of routes built once at startup.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<EventRoute>,
}

impl RouteTable {
    pub fn new(routes: Vec<EventRoute>) -> Self {
        Self { routes }
    }

    pub fn routes(&self) -> &[EventRoute] {
        &self.routes
    }

    pub fn route_for(&self, sink_name: &str) -> Option<&EventRoute> {
        self.routes.iter().find(|r| r.sink_name == sink_name)
    }

    /// Union of all subscribed types.
    pub fn subscribed_types(&self) -> HashSet<SinkEventType> {
        self.routes
            .iter()
            .flat_map(|r| r.event_types.iter().copied())
            .collect()
    }

    /// Families worth generating: at least one route subscribes to one of their types.
    pub fn subscribed_families(&self) -> HashSet<EventFamily> {
        self.subscribed_types().iter().map(|t| t.family()).collect()
    }

    /// Group events per sink, preserving production order within each group.
    pub fn group<'a>(&'a self, events: &[GeneratedEvent]) -> Vec<(&'a EventRoute, Vec<crate::CloudEvent>)> {
        self.routes
            .iter()
            .filter_map(|route| {
                let batch: Vec<_> = events
                    .iter()
                    .filter(|e| route.accepts(e.kind))
                    .map(|e| route.prepare(e))
                    .collect();
                (!batch.is_empty()).then_some((route, batch))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CloudEvent;
    use chrono::Utc;
    use serde_json::json;

    fn generated(kind: SinkEventType) -> GeneratedEvent {
        GeneratedEvent::new(
            kind,
            CloudEvent::new("src", kind.default_type_suffix(), "room-1", Utc::now(), json!({})),
        )
    }

    #[test]
    fn test_route_matching() {
        let route = EventRoute::new("kafka", [SinkEventType::TwinCreate, SinkEventType::TwinUpdate]);
        assert!(route.accepts(SinkEventType::TwinCreate));
        assert!(!route.accepts(SinkEventType::PropertyEvent));
        assert!(EventRoute::all("any").accepts(SinkEventType::Telemetry));
    }

    #[test]
    fn test_grouping_with_overrides() {
        let table = RouteTable::new(vec![
            EventRoute::new("a", [SinkEventType::TwinLifecycle]),
            EventRoute::new("b", [SinkEventType::PropertyEvent])
                .with_type_override(SinkEventType::PropertyEvent, "custom.property"),
        ]);

        let events = vec![
            generated(SinkEventType::PropertyEvent),
            generated(SinkEventType::PropertyEvent),
            generated(SinkEventType::TwinUpdate),
        ];

        let groups = table.group(&events);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].0.sink_name, "b");
        assert_eq!(groups[0].1.len(), 2);
        assert!(groups[0].1.iter().all(|e| e.event_type == "custom.property"));
        assert_eq!(groups[0].1[0].id, events[0].event.id);
    }

    #[test]
    fn test_subscribed_families() {
        let table = RouteTable::new(vec![EventRoute::new("a", [SinkEventType::TwinLifecycle])]);
        let families = table.subscribed_families();
        assert!(families.contains(&EventFamily::DataHistory));
        assert!(!families.contains(&EventFamily::Notification));
        assert!(table.route_for("a").is_some());
        assert!(table.route_for("missing").is_none());
    }
}
