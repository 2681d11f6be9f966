//! Sink and dead-letter contracts, with in-memory implementations

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{CloudEvent, DeadLetterRecord, DeadLetterStatus, Result, TwinCdcError};

/// Downstream delivery target.
///
/// `send` is best effort and may fail; callers own retries.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, events: &[CloudEvent]) -> Result<()>;

    fn is_healthy(&self) -> bool;

    /// Flush and release client resources.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// A dead-letter record together with its storage id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDeadLetter {
    pub id: i64,
    pub record: DeadLetterRecord,
}

/// Durable store for events that exhausted their delivery attempts.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn persist(&self, record: DeadLetterRecord) -> Result<()>;

    async fn list(&self, status: DeadLetterStatus, limit: i64) -> Result<Vec<StoredDeadLetter>>;

    /// Returns false when no record has the given id.
    async fn update_status(&self, id: i64, status: DeadLetterStatus) -> Result<bool>;
}

/// Dead-letter store kept in process memory.
#[derive(Default)]
pub struct MemoryDeadLetterStore {
    records: Mutex<Vec<StoredDeadLetter>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<DeadLetterRecord> {
        self.records
            .lock()
            .await
            .iter()
            .map(|s| s.record.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn persist(&self, record: DeadLetterRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        let id = records.len() as i64 + 1;
        debug!(id, event_id = %record.event_id, sink = %record.sink_name, "Dead letter stored in memory");
        records.push(StoredDeadLetter { id, record });
        Ok(())
    }

    async fn list(&self, status: DeadLetterStatus, limit: i64) -> Result<Vec<StoredDeadLetter>> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|s| s.record.status == status)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn update_status(&self, id: i64, status: DeadLetterStatus) -> Result<bool> {
        let mut records = self.records.lock().await;
        match records.iter_mut().find(|s| s.id == id) {
            Some(stored) => {
                stored.record.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Sink that records every delivered batch; can be told to fail.
pub struct MemorySink {
    name: String,
    delivered: Mutex<Vec<CloudEvent>>,
    batches: AtomicU32,
    attempts: AtomicU32,
    failing: AtomicBool,
    healthy: AtomicBool,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delivered: Mutex::new(Vec::new()),
            batches: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            failing: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
        }
    }

    /// A sink whose every send fails.
    pub fn failing(name: impl Into<String>) -> Self {
        let sink = Self::new(name);
        sink.set_failing(true);
        sink
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn delivered(&self) -> Vec<CloudEvent> {
        self.delivered.lock().await.clone()
    }

    pub fn batch_count(&self) -> u32 {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, events: &[CloudEvent]) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            self.healthy.store(false, Ordering::SeqCst);
            return Err(TwinCdcError::sink(format!("{} is configured to fail", self.name)));
        }

        self.delivered.lock().await.extend_from_slice(events);
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.healthy.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
