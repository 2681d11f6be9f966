//! Shared event consumer: drains the event queue, runs the factory and fans
//! the results out to subscribed sinks.
//!
//! Every sink gets its own dispatch lane (a bounded channel plus a worker
//! task), so a slow or failing sink only backs up its own lane. Groups for one
//! sink are delivered in the order they were produced.

use metrics::{counter, histogram};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    CloudEvent, EventData, EventFactory, EventFamily, EventQueueReceiver, EventRoute, EventSink,
    Result, RouteTable, TwinCdcError,
};

pub const DEFAULT_LANE_CAPACITY: usize = 1000;
const MAX_COALESCED_EVENTS: usize = 500;

/// Counters reported when the consumer stops.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumerStats {
    pub records_processed: u64,
    pub records_failed: u64,
    pub events_dispatched: u64,
}

pub struct SharedEventConsumer {
    factory: EventFactory,
    routes: RouteTable,
    sinks: HashMap<String, Arc<dyn EventSink>>,
    families: HashSet<EventFamily>,
    lane_capacity: usize,
}

impl SharedEventConsumer {
    /// Build a consumer. Sinks without a route receive every event type;
    /// a route naming an unknown sink is a configuration error.
    pub fn new(
        factory: EventFactory,
        routes: Vec<EventRoute>,
        sinks: Vec<Arc<dyn EventSink>>,
        enabled_families: HashSet<EventFamily>,
    ) -> Result<Self> {
        let sinks: HashMap<String, Arc<dyn EventSink>> = sinks
            .into_iter()
            .map(|sink| (sink.name().to_string(), sink))
            .collect();

        if let Some(orphan) = routes.iter().find(|r| !sinks.contains_key(&r.sink_name)) {
            return Err(TwinCdcError::ConfigError(format!(
                "Route references unknown sink '{}'",
                orphan.sink_name
            )));
        }

        let mut routes = routes;
        let mut unrouted: Vec<_> = sinks
            .keys()
            .filter(|name| !routes.iter().any(|r| &r.sink_name == *name))
            .cloned()
            .collect();
        unrouted.sort();
        routes.extend(unrouted.into_iter().map(EventRoute::all));

        let routes = RouteTable::new(routes);
        let families = routes
            .subscribed_families()
            .intersection(&enabled_families)
            .copied()
            .collect();

        Ok(Self {
            factory,
            routes,
            sinks,
            families,
            lane_capacity: DEFAULT_LANE_CAPACITY,
        })
    }

    pub fn with_lane_capacity(mut self, capacity: usize) -> Self {
        self.lane_capacity = capacity.max(1);
        self
    }

    /// Families that are both enabled and subscribed by at least one sink.
    pub fn families(&self) -> &HashSet<EventFamily> {
        &self.families
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Generate and group the events for one record, per sink name.
    pub fn route_events(&self, data: &EventData) -> Result<Vec<(String, Vec<CloudEvent>)>> {
        let generated = self.factory.create_events(data, &self.families)?;
        for event in &generated {
            counter!("twincdc_events_generated_total", "kind" => event.kind.as_str()).increment(1);
        }

        Ok(self
            .routes
            .group(&generated)
            .into_iter()
            .map(|(route, batch)| (route.sink_name.clone(), batch))
            .collect())
    }

    /// Drain the queue until it is closed, then flush every lane.
    #[instrument(skip(self, queue), fields(sinks = self.sinks.len()))]
    pub async fn run(self, mut queue: EventQueueReceiver) -> Result<ConsumerStats> {
        info!(
            families = ?self.families,
            lane_capacity = self.lane_capacity,
            "Starting shared event consumer"
        );

        let mut lanes = HashMap::new();
        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        for (name, sink) in &self.sinks {
            let (tx, rx) = mpsc::channel(self.lane_capacity);
            lanes.insert(name.clone(), tx);
            workers.push(tokio::spawn(lane_worker(sink.clone(), rx)));
        }

        let mut stats = ConsumerStats::default();
        while let Some(data) = queue.dequeue().await {
            match self.route_events(&data) {
                Ok(groups) => {
                    stats.records_processed += 1;
                    for (sink_name, batch) in groups {
                        let Some(lane) = lanes.get(&sink_name) else {
                            continue;
                        };
                        stats.events_dispatched += batch.len() as u64;
                        if lane.send(batch).await.is_err() {
                            error!(sink = %sink_name, "Dispatch lane closed unexpectedly");
                        }
                    }
                }
                Err(e) => {
                    stats.records_failed += 1;
                    counter!("twincdc_records_failed_total", "event_type" => data.event_type.as_str())
                        .increment(1);
                    error!(
                        event_type = %data.event_type,
                        error = %e,
                        "Failed to build events for change record, skipping it"
                    );
                }
            }
        }

        info!("Event queue closed, flushing dispatch lanes");
        drop(lanes);
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Dispatch lane worker failed: {}", e);
            }
        }

        info!(
            records = stats.records_processed,
            failed = stats.records_failed,
            dispatched = stats.events_dispatched,
            "Shared event consumer stopped"
        );
        Ok(stats)
    }
}

/// Deliver batches for one sink, coalescing whatever is already queued.
async fn lane_worker(sink: Arc<dyn EventSink>, mut rx: mpsc::Receiver<Vec<CloudEvent>>) {
    let name = sink.name().to_string();

    while let Some(mut batch) = rx.recv().await {
        while batch.len() < MAX_COALESCED_EVENTS {
            match rx.try_recv() {
                Ok(more) => batch.extend(more),
                Err(_) => break,
            }
        }

        let started = Instant::now();
        match sink.send(&batch).await {
            Ok(()) => {
                debug!(sink = %name, events = batch.len(), "Batch delivered");
                counter!("twincdc_sink_events_total", "sink" => name.clone(), "status" => "success")
                    .increment(batch.len() as u64);
            }
            Err(e) => {
                warn!(sink = %name, events = batch.len(), error = %e, "Batch delivery failed");
                counter!("twincdc_sink_events_total", "sink" => name.clone(), "status" => "error")
                    .increment(batch.len() as u64);
            }
        }
        histogram!("twincdc_sink_send_duration_seconds", "sink" => name.clone())
            .record(started.elapsed().as_secs_f64());
    }

    if let Err(e) = sink.shutdown().await {
        warn!(sink = %name, error = %e, "Sink shutdown failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event_queue, MemorySink, SinkEventType};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    fn families() -> HashSet<EventFamily> {
        [EventFamily::Notification, EventFamily::DataHistory, EventFamily::Telemetry]
            .into_iter()
            .collect()
    }

    fn three_property_update() -> EventData {
        EventData::twin_update(
            json!({"$dtId": "room-1", "$metadata": {"$model": "dtmi:x:Room;1"}, "a": 1, "b": 1, "c": 1}),
            json!({"$dtId": "room-1", "$metadata": {"$model": "dtmi:x:Room;1"}, "a": 2, "b": 2, "c": 2}),
        )
    }

    #[tokio::test]
    async fn test_disjoint_routes() {
        let a = Arc::new(MemorySink::new("a"));
        let b = Arc::new(MemorySink::new("b"));
        let consumer = SharedEventConsumer::new(
            EventFactory::new("https://graph.example.com"),
            vec![
                EventRoute::new("a", [SinkEventType::TwinLifecycle]),
                EventRoute::new("b", [SinkEventType::PropertyEvent]),
            ],
            vec![a.clone() as Arc<dyn EventSink>, b.clone()],
            families(),
        )
        .unwrap();
        assert!(!consumer.families().contains(&EventFamily::Notification));

        let (tx, rx) = event_queue(8);
        tx.enqueue(three_property_update()).await.unwrap();
        drop(tx);

        let stats = consumer.run(rx).await.unwrap();
        assert_eq!(stats.records_processed, 1);
        assert_eq!(stats.events_dispatched, 3);
        assert!(a.delivered().await.is_empty());
        assert_eq!(b.delivered().await.len(), 3);
    }

    #[tokio::test]
    async fn test_unrouted_sink_receives_everything() {
        let sink = Arc::new(MemorySink::new("all"));
        let consumer = SharedEventConsumer::new(
            EventFactory::new("src"),
            Vec::new(),
            vec![sink.clone() as Arc<dyn EventSink>],
            families(),
        )
        .unwrap();

        let groups = consumer
            .route_events(&EventData::twin_create(json!({"$dtId": "t", "p": 1})))
            .unwrap();
        assert_eq!(groups.len(), 1);
        // notification create + lifecycle + one property
        assert_eq!(groups[0].1.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_route_sink_rejected() {
        let result = SharedEventConsumer::new(
            EventFactory::new("src"),
            vec![EventRoute::all("ghost")],
            Vec::new(),
            families(),
        );
        assert!(matches!(result, Err(TwinCdcError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_invalid_record_does_not_stop_consumer() {
        let sink = Arc::new(MemorySink::new("s"));
        let consumer = SharedEventConsumer::new(
            EventFactory::new("src"),
            vec![EventRoute::new("s", [SinkEventType::TwinCreate])],
            vec![sink.clone() as Arc<dyn EventSink>],
            families(),
        )
        .unwrap();

        let (tx, rx) = event_queue(8);
        tx.enqueue(EventData::twin_create(json!({"no": "id"}))).await.unwrap();
        tx.enqueue(EventData::twin_create(json!({"$dtId": "ok"}))).await.unwrap();
        drop(tx);

        let stats = consumer.run(rx).await.unwrap();
        assert_eq!(stats.records_failed, 1);
        assert_eq!(stats.records_processed, 1);
        assert_eq!(sink.delivered().await[0].subject, "ok");
    }

    struct SlowSink {
        inner: MemorySink,
    }

    #[async_trait]
    impl EventSink for SlowSink {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn send(&self, events: &[CloudEvent]) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.inner.send(events).await
        }

        fn is_healthy(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_slow_sink_does_not_block_others() {
        let slow = Arc::new(SlowSink {
            inner: MemorySink::new("slow"),
        });
        let fast = Arc::new(MemorySink::new("fast"));
        let failing = Arc::new(MemorySink::failing("failing"));

        let consumer = SharedEventConsumer::new(
            EventFactory::new("src"),
            vec![
                EventRoute::new("slow", [SinkEventType::TwinCreate]),
                EventRoute::new("fast", [SinkEventType::TwinCreate]),
                EventRoute::new("failing", [SinkEventType::TwinCreate]),
            ],
            vec![
                slow.clone() as Arc<dyn EventSink>,
                fast.clone(),
                failing.clone(),
            ],
            families(),
        )
        .unwrap();

        let (tx, rx) = event_queue(8);
        let handle = tokio::spawn(consumer.run(rx));
        for i in 0..3 {
            tx.enqueue(EventData::twin_create(json!({"$dtId": format!("t{}", i)})))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let fast_subjects: Vec<_> = fast.delivered().await.into_iter().map(|e| e.subject).collect();
        assert_eq!(fast_subjects, vec!["t0", "t1", "t2"]);
        assert!(slow.inner.delivered().await.len() < 3);

        drop(tx);
        handle.await.unwrap().unwrap();
        assert_eq!(slow.inner.delivered().await.len(), 3);
        assert!(failing.attempt_count() >= 1);
    }

    #[tokio::test]
    async fn test_sink_shut_down_once_after_queue_closes() {
        let mut mock = crate::MockEventSink::new();
        mock.expect_name().return_const("mock".to_string());
        mock.expect_is_healthy().return_const(true);
        mock.expect_send().times(1).returning(|_| Ok(()));
        mock.expect_shutdown().times(1).returning(|| Ok(()));

        let consumer = SharedEventConsumer::new(
            EventFactory::new("src"),
            vec![EventRoute::new("mock", [SinkEventType::TwinCreate])],
            vec![Arc::new(mock) as Arc<dyn EventSink>],
            families(),
        )
        .unwrap();

        let (tx, rx) = event_queue(4);
        tx.enqueue(EventData::twin_create(json!({"$dtId": "t"}))).await.unwrap();
        drop(tx);

        let stats = tokio_test::assert_ok!(consumer.run(rx).await);
        assert_eq!(stats.events_dispatched, 1);
    }
}
