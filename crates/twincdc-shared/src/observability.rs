//! Observability features: structured logging and Prometheus metrics

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tokio::time::{Duration, Instant};
use tracing::{info, Level};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::config::{LoggingConfig, MetricsConfig, ObservabilityConfig};

/// Logging and metrics bootstrap. The handle returned by `init` is owned by
/// the caller; a second `init` fails because the subscriber is already set.
#[derive(Debug)]
pub struct ObservabilitySystem {
    metrics_enabled: bool,
}

impl ObservabilitySystem {
    /// Initialize the observability system
    pub fn init(config: &ObservabilityConfig) -> anyhow::Result<Self> {
        let system = Self {
            metrics_enabled: config.metrics.enabled,
        };

        Self::init_logging(&config.logging)?;

        if config.metrics.enabled {
            Self::init_metrics(&config.metrics)?;
        }

        info!(metrics = system.metrics_enabled, "Observability system initialized");
        Ok(system)
    }

    /// Initialize structured logging
    fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
        let level = match config.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };

        let env_filter = EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy();

        let registry = tracing_subscriber::registry().with(env_filter);

        match config.format.to_lowercase().as_str() {
            "json" => {
                let json_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE);
                registry.with(json_layer).try_init()?;
            }
            _ => {
                let pretty_layer = tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_span_events(FmtSpan::CLOSE);
                registry.with(pretty_layer).try_init()?;
            }
        }

        Ok(())
    }

    /// Install the Prometheus recorder with its own scrape listener.
    /// Must run inside a tokio runtime.
    fn init_metrics(config: &MetricsConfig) -> anyhow::Result<()> {
        let bind_addr: SocketAddr = config.bind_address.parse()?;

        PrometheusBuilder::new()
            .with_http_listener(bind_addr)
            .install()?;

        info!("Prometheus metrics exposed on {}", bind_addr);
        Ok(())
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics_enabled
    }
}

/// Pipeline metrics
pub struct EventMetrics;

impl EventMetrics {
    /// A WAL change became an EventData record.
    pub fn change_captured(event_type: &str) {
        counter!("twincdc_changes_captured_total", "event_type" => event_type.to_string())
            .increment(1);
    }

    /// A WAL change was skipped with a diagnostic.
    pub fn change_skipped(reason: &str) {
        counter!("twincdc_changes_skipped_total", "reason" => reason.to_string()).increment(1);
    }

    /// A batch was enqueued and confirmed.
    pub fn batch_confirmed(records: usize, duration: Duration) {
        counter!("twincdc_batches_confirmed_total").increment(1);
        histogram!("twincdc_batch_records").record(records as f64);
        histogram!("twincdc_batch_duration_seconds").record(duration.as_secs_f64());
    }

    /// A telemetry notification was accepted.
    pub fn telemetry_received(accepted: bool) {
        let status = if accepted { "accepted" } else { "skipped" };
        counter!("twincdc_telemetry_notifications_total", "status" => status).increment(1);
    }

    /// One delivery attempt against a sink.
    pub fn sink_attempt(sink: &str, success: bool) {
        let status = if success { "success" } else { "error" };
        counter!("twincdc_sink_attempts_total",
                "sink" => sink.to_string(),
                "status" => status)
            .increment(1);
    }

    /// Events written to the dead-letter store.
    pub fn dead_lettered(sink: &str, count: usize) {
        counter!("twincdc_dead_letters_total", "sink" => sink.to_string())
            .increment(count as u64);
    }

    /// Sink health as a 0/1 gauge.
    pub fn sink_health(sink: &str, healthy: bool) {
        gauge!("twincdc_sink_healthy", "sink" => sink.to_string())
            .set(if healthy { 1.0 } else { 0.0 });
    }

    /// Replication lag between the server WAL position and the confirmed checkpoint.
    pub fn replication_lag(bytes: u64) {
        gauge!("twincdc_replication_lag_bytes").set(bytes as f64);
    }
}

/// Records elapsed time into a histogram when dropped
pub struct PerfTimer {
    start: Instant,
    metric_name: String,
    labels: Vec<(String, String)>,
}

impl PerfTimer {
    pub fn new(metric_name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            metric_name: metric_name.into(),
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn record(&self) {
        let labels: Vec<metrics::Label> = self
            .labels
            .iter()
            .map(|(k, v)| metrics::Label::new(k.clone(), v.clone()))
            .collect();
        histogram!(self.metric_name.clone(), labels).record(self.start.elapsed().as_secs_f64());
    }
}

impl Drop for PerfTimer {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            self.record();
        }
    }
}
