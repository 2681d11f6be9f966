//! Retry, health tracking and dead-lettering around any sink

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use twincdc_core::{CloudEvent, DeadLetterRecord, DeadLetterStore, EventSink, Result, TwinCdcError};
use twincdc_shared::{EventMetrics, ExponentialBackoff, RetryExecutor, RetryPolicy};

/// Decorates a sink with bounded retries. When the attempts run out every
/// undelivered event of the batch is written to the dead-letter store and
/// `send` still returns `Ok`, so the dispatch lane keeps going. A sink that
/// reports `PartialDelivery` is retried with the remainder only.
pub struct ResilientSink<P: RetryPolicy = ExponentialBackoff> {
    inner: Arc<dyn EventSink>,
    retry: RetryExecutor<P>,
    dead_letters: Option<Arc<dyn DeadLetterStore>>,
    healthy: AtomicBool,
}

impl<P: RetryPolicy> ResilientSink<P> {
    pub fn new(inner: Arc<dyn EventSink>, retry: RetryExecutor<P>, dead_letters: Option<Arc<dyn DeadLetterStore>>) -> Self {
        Self {
            inner,
            retry,
            dead_letters,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn inner(&self) -> &Arc<dyn EventSink> {
        &self.inner
    }

    fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
        EventMetrics::sink_health(self.inner.name(), healthy);
    }

    async fn dead_letter(&self, events: &[CloudEvent], error_message: &str, error_stack: &str, attempts: u32, first_attempt_at: chrono::DateTime<Utc>) {
        let Some(store) = &self.dead_letters else {
            error!(
                sink = %self.inner.name(),
                count = events.len(),
                error = %error_message,
                "Dropping undeliverable events, dead-letter store disabled"
            );
            return;
        };

        let mut stored = 0;
        for event in events {
            let record = match DeadLetterRecord::new(event, self.inner.name(), error_message, attempts, first_attempt_at) {
                Ok(record) => record.with_error_stack(error_stack),
                Err(e) => {
                    error!(event_id = %event.id, error = %e, "Could not build dead-letter record");
                    continue;
                }
            };

            match store.persist(record).await {
                Ok(()) => stored += 1,
                Err(e) => error!(event_id = %event.id, sink = %self.inner.name(), error = %e, "Failed to persist dead letter"),
            }
        }

        EventMetrics::dead_lettered(self.inner.name(), stored);
        warn!(sink = %self.inner.name(), stored, attempts, "Events moved to dead-letter store");
    }
}

#[async_trait]
impl<P: RetryPolicy + 'static> EventSink for ResilientSink<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    #[instrument(skip(self, events), fields(sink = %self.inner.name(), count = events.len()))]
    async fn send(&self, events: &[CloudEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let first_attempt_at = Utc::now();
        let delivered = AtomicUsize::new(0);
        let outcome = self
            .retry
            .execute_counted(|attempt| {
                let inner = self.inner.clone();
                let delivered = &delivered;
                async move {
                    let offset = delivered.load(Ordering::SeqCst).min(events.len());
                    let result = inner.send(&events[offset..]).await;
                    EventMetrics::sink_attempt(inner.name(), result.is_ok());
                    if let Err(e) = &result {
                        if let TwinCdcError::PartialDelivery { delivered: progress, .. } = e {
                            delivered.fetch_add(*progress, Ordering::SeqCst);
                        }
                        warn!(attempt, offset, error = %e, "Sink delivery attempt failed");
                    }
                    result
                }
            })
            .await;

        match outcome {
            Ok(()) => {
                self.set_healthy(true);
                Ok(())
            }
            Err(exhausted) => {
                self.set_healthy(false);
                let message = exhausted.error.to_string();
                let stack = format!("{:?}", exhausted.error);
                let remaining = &events[delivered.load(Ordering::SeqCst).min(events.len())..];
                self.dead_letter(remaining, &message, &stack, exhausted.attempts, first_attempt_at)
                    .await;
                Ok(())
            }
        }
    }

    /// Unhealthy after a terminal failure, or whenever the wrapped sink
    /// reports itself unhealthy (connection loss, failed ingestion).
    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst) && self.inner.is_healthy()
    }

    async fn shutdown(&self) -> Result<()> {
        info!(sink = %self.inner.name(), "Shutting down sink");
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use twincdc_core::{DeadLetterStatus, MemoryDeadLetterStore, MemorySink};
    use twincdc_shared::fixed_interval;

    fn events(n: usize) -> Vec<CloudEvent> {
        (0..n)
            .map(|i| CloudEvent::new("src", "Twin.Create", format!("twin-{}", i), Utc::now(), json!({"i": i})))
            .collect()
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter_each_event() {
        let inner = Arc::new(MemorySink::failing("always-fails"));
        let store = Arc::new(MemoryDeadLetterStore::new());
        let sink = ResilientSink::new(
            inner.clone(),
            fixed_interval(Duration::from_millis(1), 3),
            Some(store.clone() as Arc<dyn DeadLetterStore>),
        );

        let batch = events(2);
        sink.send(&batch).await.unwrap();

        assert_eq!(inner.attempt_count(), 3);
        assert!(!sink.is_healthy());

        let records = store.records().await;
        assert_eq!(records.len(), 2);
        for (record, event) in records.iter().zip(&batch) {
            assert_eq!(record.event_id, event.id);
            assert_eq!(record.sink_name, "always-fails");
            assert_eq!(record.retry_count, 3);
            assert_eq!(record.status, DeadLetterStatus::Pending);
            assert!(record.error_message.contains("configured to fail"));
            assert!(record.error_stack.is_some());
        }
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let inner = Arc::new(MemorySink::failing("flaky"));
        let store = Arc::new(MemoryDeadLetterStore::new());
        let sink = ResilientSink::new(
            inner.clone(),
            fixed_interval(Duration::from_millis(1), 1),
            Some(store.clone() as Arc<dyn DeadLetterStore>),
        );

        sink.send(&events(1)).await.unwrap();
        assert!(!sink.is_healthy());

        inner.set_failing(false);
        sink.send(&events(3)).await.unwrap();
        assert!(sink.is_healthy());
        assert_eq!(inner.delivered().await.len(), 3);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_without_store_failures_are_swallowed() {
        let inner = Arc::new(MemorySink::failing("no-dlq"));
        let sink = ResilientSink::new(inner.clone(), fixed_interval(Duration::from_millis(1), 2), None);

        assert!(sink.send(&events(1)).await.is_ok());
        assert_eq!(inner.attempt_count(), 2);
        assert_eq!(sink.name(), "no-dlq");
    }

    struct DegradedSink;

    #[async_trait]
    impl EventSink for DegradedSink {
        fn name(&self) -> &str {
            "degraded"
        }

        async fn send(&self, _events: &[CloudEvent]) -> Result<()> {
            Ok(())
        }

        fn is_healthy(&self) -> bool {
            false
        }
    }

    /// Delivers at most `per_call` events per send, then fails on the next.
    struct ChunkedSink {
        per_call: usize,
        fail_always: bool,
        delivered: tokio::sync::Mutex<Vec<String>>,
    }

    impl ChunkedSink {
        fn new(per_call: usize, fail_always: bool) -> Self {
            Self {
                per_call,
                fail_always,
                delivered: tokio::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EventSink for ChunkedSink {
        fn name(&self) -> &str {
            "chunked"
        }

        async fn send(&self, events: &[CloudEvent]) -> Result<()> {
            let take = self.per_call.min(events.len());
            let mut delivered = self.delivered.lock().await;
            delivered.extend(events[..take].iter().map(|e| e.subject.clone()));
            if take == events.len() && !self.fail_always {
                return Ok(());
            }
            Err(TwinCdcError::after_delivered(take, TwinCdcError::sink("receiver rejected event")))
        }

        fn is_healthy(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_partial_delivery_retries_remainder() {
        let inner = Arc::new(ChunkedSink::new(2, false));
        let store = Arc::new(MemoryDeadLetterStore::new());
        let sink = ResilientSink::new(
            inner.clone() as Arc<dyn EventSink>,
            fixed_interval(Duration::from_millis(1), 3),
            Some(store.clone() as Arc<dyn DeadLetterStore>),
        );

        sink.send(&events(5)).await.unwrap();

        let delivered = inner.delivered.lock().await.clone();
        assert_eq!(delivered, vec!["twin-0", "twin-1", "twin-2", "twin-3", "twin-4"]);
        assert_eq!(store.len().await, 0);
        assert!(sink.is_healthy());
    }

    #[tokio::test]
    async fn test_only_undelivered_events_are_dead_lettered() {
        let inner = Arc::new(ChunkedSink::new(1, true));
        let store = Arc::new(MemoryDeadLetterStore::new());
        let sink = ResilientSink::new(
            inner.clone() as Arc<dyn EventSink>,
            fixed_interval(Duration::from_millis(1), 2),
            Some(store.clone() as Arc<dyn DeadLetterStore>),
        );

        let batch = events(4);
        sink.send(&batch).await.unwrap();

        let delivered = inner.delivered.lock().await.clone();
        assert_eq!(delivered, vec!["twin-0", "twin-1"]);

        let records = store.records().await;
        let ids: Vec<_> = records.iter().map(|r| r.event_id.clone()).collect();
        let expected: Vec<_> = batch[2..].iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, expected);
        assert!(records.iter().all(|r| r.retry_count == 2));
    }

    #[tokio::test]
    async fn test_inner_health_is_reported() {
        let sink = ResilientSink::new(
            Arc::new(DegradedSink) as Arc<dyn EventSink>,
            fixed_interval(Duration::from_millis(1), 1),
            None,
        );
        assert!(!sink.is_healthy());

        sink.send(&events(1)).await.unwrap();
        assert!(!sink.is_healthy());
    }
}
