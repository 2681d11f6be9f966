//! Bounded hand-off between change capture and the consumer.
//!
//! The queue is the only state shared between producers and the consumer.
//! `enqueue` waits while the queue is full, which throttles capture when
//! delivery falls behind.

use metrics::gauge;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::trace;

use crate::{EventData, Result, TwinCdcError};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Create a bounded event queue.
pub fn event_queue(capacity: usize) -> (EventQueueSender, EventQueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventQueueSender { tx }, EventQueueReceiver { rx })
}

/// Producer handle. Cheap to clone; the queue closes when every sender is dropped.
#[derive(Debug, Clone)]
pub struct EventQueueSender {
    tx: mpsc::Sender<EventData>,
}

impl EventQueueSender {
    pub async fn enqueue(&self, data: EventData) -> Result<()> {
        self.tx.send(data).await.map_err(|_| TwinCdcError::QueueClosed)?;
        gauge!("twincdc_queue_depth").set(self.len() as f64);
        Ok(())
    }

    /// Enqueue a whole batch in order. Returns once every record is accepted.
    pub async fn enqueue_batch(&self, batch: Vec<EventData>) -> Result<usize> {
        let count = batch.len();
        for data in batch {
            self.tx.send(data).await.map_err(|_| TwinCdcError::QueueClosed)?;
        }
        trace!(count, "Batch enqueued");
        gauge!("twincdc_queue_depth").set(self.len() as f64);
        Ok(count)
    }

    /// Records currently waiting.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer handle.
#[derive(Debug)]
pub struct EventQueueReceiver {
    rx: mpsc::Receiver<EventData>,
}

impl EventQueueReceiver {
    /// Next record, or `None` once the queue is closed and drained.
    pub async fn dequeue(&mut self) -> Option<EventData> {
        self.rx.recv().await
    }

    /// Stop accepting new records; queued ones can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn into_stream(self) -> ReceiverStream<EventData> {
        ReceiverStream::new(self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_fifo_order() {
        let (tx, mut rx) = event_queue(10);
        let batch: Vec<_> = (0..3)
            .map(|i| EventData::twin_create(json!({"$dtId": format!("t{}", i)})))
            .collect();

        assert_eq!(tx.enqueue_batch(batch).await.unwrap(), 3);
        assert_eq!(tx.len(), 3);

        for i in 0..3 {
            let data = rx.dequeue().await.unwrap();
            assert_eq!(data.new_value.unwrap()["$dtId"], format!("t{}", i));
        }
        assert!(tx.is_empty());
    }

    #[tokio::test]
    async fn test_backpressure_when_full() {
        let (tx, mut rx) = event_queue(1);
        tx.enqueue(EventData::twin_delete(json!({"$dtId": "a"}))).await.unwrap();

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            tx.enqueue(EventData::twin_delete(json!({"$dtId": "b"}))),
        )
        .await;
        assert!(blocked.is_err(), "enqueue should wait while the queue is full");

        rx.dequeue().await.unwrap();
        tx.enqueue(EventData::twin_delete(json!({"$dtId": "c"}))).await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_when_senders_dropped() {
        let (tx, rx) = event_queue(4);
        tx.enqueue(EventData::twin_create(json!({"$dtId": "a"}))).await.unwrap();
        drop(tx);

        let collected: Vec<_> = rx.into_stream().collect().await;
        assert_eq!(collected.len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_after_close_fails() {
        let (tx, mut rx) = event_queue(4);
        rx.close();
        let result = tx.enqueue(EventData::twin_create(json!({"$dtId": "a"}))).await;
        assert!(matches!(result, Err(TwinCdcError::QueueClosed)));
    }
}
