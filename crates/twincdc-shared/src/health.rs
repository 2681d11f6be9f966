//! Health checks and their aggregation into a liveness report

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use twincdc_core::EventSink;

/// Health check status
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded { reason: String },
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded { .. } => "degraded",
            HealthStatus::Unhealthy { .. } => "unhealthy",
        }
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy { .. })
    }
}

/// Component health check trait
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self) -> HealthStatus;
}

/// Aggregated view served by the liveness probe.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub checks: BTreeMap<String, HealthStatus>,
}

/// System health aggregator
#[derive(Default)]
pub struct HealthAggregator {
    checks: Vec<Arc<dyn HealthCheck>>,
}

impl HealthAggregator {
    pub fn new() -> Self {
        Self { checks: Vec::new() }
    }

    pub fn add_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.checks.push(check);
        self
    }

    pub fn check_all(&self) -> Vec<(String, HealthStatus)> {
        self.checks
            .iter()
            .map(|check| (check.name().to_string(), check.check()))
            .collect()
    }

    pub fn overall_status(&self) -> HealthStatus {
        Self::combine(&self.check_all())
    }

    pub fn report(&self) -> HealthReport {
        let results = self.check_all();
        let status = Self::combine(&results).as_str();
        HealthReport {
            status,
            checks: results.into_iter().collect(),
        }
    }

    fn combine(results: &[(String, HealthStatus)]) -> HealthStatus {
        let unhealthy: Vec<_> = results
            .iter()
            .filter_map(|(name, status)| match status {
                HealthStatus::Unhealthy { reason } => Some(format!("{}: {}", name, reason)),
                _ => None,
            })
            .collect();

        if !unhealthy.is_empty() {
            return HealthStatus::Unhealthy {
                reason: unhealthy.join(", "),
            };
        }

        let degraded: Vec<_> = results
            .iter()
            .filter_map(|(name, status)| match status {
                HealthStatus::Degraded { reason } => Some(format!("{}: {}", name, reason)),
                _ => None,
            })
            .collect();

        if !degraded.is_empty() {
            return HealthStatus::Degraded {
                reason: degraded.join(", "),
            };
        }

        HealthStatus::Healthy
    }
}

/// Replication progress: connected and polling within the stale timeout.
///
/// Shared between the capture subscriber, which records activity, and the
/// probe, which reads it synchronously.
pub struct ReplicationHealth {
    name: String,
    connected: AtomicBool,
    last_activity: Mutex<Instant>,
    timeout: Duration,
}

impl ReplicationHealth {
    pub fn new(timeout: Duration) -> Self {
        Self {
            name: "replication".to_string(),
            connected: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            timeout,
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if connected {
            self.record_activity();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Update the last activity timestamp
    pub fn record_activity(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }
}

impl HealthCheck for ReplicationHealth {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self) -> HealthStatus {
        if !self.is_connected() {
            return HealthStatus::Unhealthy {
                reason: "Replication connection is down".to_string(),
            };
        }

        let elapsed = self.idle_for();
        if elapsed > self.timeout {
            HealthStatus::Unhealthy {
                reason: format!("No replication progress for {:?}", elapsed),
            }
        } else if elapsed > self.timeout / 2 {
            HealthStatus::Degraded {
                reason: format!("Replication slow, last progress {:?} ago", elapsed),
            }
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Every enabled sink currently reports healthy.
pub struct SinkHealthCheck {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl SinkHealthCheck {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl HealthCheck for SinkHealthCheck {
    fn name(&self) -> &str {
        "event_sinks"
    }

    fn check(&self) -> HealthStatus {
        let failing: Vec<_> = self
            .sinks
            .iter()
            .filter(|sink| !sink.is_healthy())
            .map(|sink| sink.name().to_string())
            .collect();

        if failing.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy {
                reason: format!("Unhealthy sinks: {}", failing.join(", ")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twincdc_core::MemorySink;

    struct FixedCheck {
        name: String,
        status: HealthStatus,
    }

    impl HealthCheck for FixedCheck {
        fn name(&self) -> &str {
            &self.name
        }

        fn check(&self) -> HealthStatus {
            self.status.clone()
        }
    }

    #[test]
    fn test_health_aggregator() {
        let aggregator = HealthAggregator::new()
            .add_check(Arc::new(FixedCheck {
                name: "test1".to_string(),
                status: HealthStatus::Healthy,
            }))
            .add_check(Arc::new(FixedCheck {
                name: "test2".to_string(),
                status: HealthStatus::Unhealthy {
                    reason: "test error".to_string(),
                },
            }));

        match aggregator.overall_status() {
            HealthStatus::Unhealthy { reason } => {
                assert!(reason.contains("test2"));
                assert!(reason.contains("test error"));
            }
            other => panic!("Expected unhealthy status, got {:?}", other),
        }

        let report = aggregator.report();
        assert_eq!(report.status, "unhealthy");
        assert_eq!(report.checks.len(), 2);
    }

    #[test]
    fn test_report_serialization() {
        let aggregator = HealthAggregator::new().add_check(Arc::new(FixedCheck {
            name: "replication".to_string(),
            status: HealthStatus::Degraded {
                reason: "slow".to_string(),
            },
        }));

        let json = serde_json::to_value(aggregator.report()).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["checks"]["replication"]["status"], "degraded");
        assert_eq!(json["checks"]["replication"]["reason"], "slow");
    }

    #[tokio::test]
    async fn test_replication_health() {
        let check = ReplicationHealth::new(Duration::from_millis(100));
        assert!(check.check().is_unhealthy());

        check.set_connected(true);
        assert_eq!(check.check(), HealthStatus::Healthy);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(check.check().is_unhealthy());

        check.record_activity();
        assert_eq!(check.check(), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_sink_health_check() {
        let good: Arc<dyn EventSink> = Arc::new(MemorySink::new("good"));
        let bad = Arc::new(MemorySink::failing("bad"));
        let sinks: Vec<Arc<dyn EventSink>> = vec![good, bad.clone() as Arc<dyn EventSink>];
        let check = SinkHealthCheck::new(sinks);
        assert_eq!(check.check(), HealthStatus::Healthy);

        assert!(bad.send(&[]).await.is_err());
        match check.check() {
            HealthStatus::Unhealthy { reason } => assert!(reason.contains("bad")),
            other => panic!("Expected unhealthy status, got {:?}", other),
        }
    }
}
