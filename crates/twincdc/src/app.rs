//! Process wiring: builds every component from configuration and supervises
//! the long-running tasks.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};
use twincdc_core::{event_queue, SharedEventConsumer};
use twincdc_pg_cdc::{CaptureSettings, ChangeCaptureSubscriber, TelemetryListener, TelemetrySettings};
use twincdc_shared::{
    listen_for_signals, HealthAggregator, HealthCheck, ReplicationHealth, ShutdownCoordinator, SinkHealthCheck,
    TwinCdcConfig,
};
use twincdc_sinks::{build_sinks, dead_letter_store, enabled_families, event_factory, event_routes};

use crate::health_server;

type TaskSlot = Option<JoinHandle<anyhow::Result<()>>>;

/// Await a task held in a slot, emptying the slot once it finishes. An empty
/// slot never resolves, which keeps it inert inside `select!`.
async fn join_slot(slot: &mut TaskSlot) -> Result<anyhow::Result<()>, JoinError> {
    match slot.as_mut() {
        Some(handle) => {
            let result = handle.await;
            *slot = None;
            result
        }
        None => std::future::pending().await,
    }
}

fn flatten(result: Result<anyhow::Result<()>, JoinError>) -> anyhow::Result<()> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(anyhow::anyhow!("task panicked or was cancelled: {}", e)),
    }
}

/// Build the pipeline and run it until a signal arrives or a task fails.
pub async fn run(config: TwinCdcConfig) -> anyhow::Result<()> {
    let shutdown = ShutdownCoordinator::with_timeout(Duration::from_secs(config.shutdown_timeout_seconds));
    tokio::spawn(listen_for_signals(shutdown.clone()));
    run_until_shutdown(config, shutdown).await
}

pub async fn run_until_shutdown(config: TwinCdcConfig, shutdown: ShutdownCoordinator) -> anyhow::Result<()> {
    let factory = event_factory(&config.events).context("invalid event settings")?;
    let routes = event_routes(&config.events).context("invalid event routes")?;
    let dead_letters = dead_letter_store(&config).context("dead-letter store")?;
    let sinks = build_sinks(&config, &factory, &routes, dead_letters).context("building sinks")?;

    let consumer = SharedEventConsumer::new(factory, routes, sinks.clone(), enabled_families(&config.events))?
        .with_lane_capacity(config.events.sink_lane_capacity);
    info!(families = ?consumer.families(), sinks = sinks.len(), "Consumer configured");

    let replication_health = Arc::new(ReplicationHealth::new(Duration::from_secs(
        config.health.replication_stale_seconds,
    )));
    let aggregator = Arc::new(
        HealthAggregator::new()
            .add_check(replication_health.clone() as Arc<dyn HealthCheck>)
            .add_check(Arc::new(SinkHealthCheck::new(sinks)) as Arc<dyn HealthCheck>),
    );

    let (queue_tx, queue_rx) = event_queue(config.events.queue_capacity);

    let subscriber = ChangeCaptureSubscriber::new(
        CaptureSettings::from_config(&config.database, &config.replication),
        queue_tx.clone(),
        replication_health,
    );
    let mut subscriber_task: TaskSlot = {
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            subscriber.run(shutdown).await.map_err(anyhow::Error::from)
        }))
    };

    let mut telemetry_task: TaskSlot = if config.telemetry.enabled {
        let listener = TelemetryListener::new(
            TelemetrySettings::from_config(&config.database, &config.telemetry),
            queue_tx.clone(),
        );
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            listener.run(shutdown).await.map_err(anyhow::Error::from)
        }))
    } else {
        None
    };

    // The queue closes once the producers above have stopped.
    drop(queue_tx);

    let mut consumer_task: TaskSlot = Some(tokio::spawn(async move {
        let stats = consumer.run(queue_rx).await?;
        info!(
            processed = stats.records_processed,
            failed = stats.records_failed,
            dispatched = stats.events_dispatched,
            "Consumer drained"
        );
        Ok::<_, anyhow::Error>(())
    }));

    let mut health_task: TaskSlot = if config.health.enabled {
        let shutdown = shutdown.clone();
        let bind_address = config.health.bind_address.clone();
        Some(tokio::spawn(async move {
            health_server::serve(&bind_address, aggregator, shutdown).await
        }))
    } else {
        None
    };

    info!("Pipeline started");

    let failure = tokio::select! {
        _ = shutdown.wait_for_shutdown() => None,
        result = join_slot(&mut subscriber_task) => Some(("change capture", flatten(result))),
        result = join_slot(&mut telemetry_task) => Some(("telemetry listener", flatten(result))),
        result = join_slot(&mut consumer_task) => Some(("consumer", flatten(result))),
        result = join_slot(&mut health_task) => Some(("health endpoint", flatten(result))),
    };

    let failure = failure.map(|(task, result)| {
        let reason = match result {
            Ok(()) => anyhow::anyhow!("{} exited unexpectedly", task),
            Err(e) => e.context(format!("{} failed", task)),
        };
        error!(error = %reason, "Fatal task exit, shutting down");
        reason
    });

    shutdown.shutdown();

    let drain = async {
        for (task, slot) in [
            ("change capture", &mut subscriber_task),
            ("telemetry listener", &mut telemetry_task),
            ("consumer", &mut consumer_task),
            ("health endpoint", &mut health_task),
        ] {
            if let Some(handle) = slot.take() {
                if let Err(e) = flatten(handle.await) {
                    warn!(task, error = %e, "Task ended with an error during shutdown");
                }
            }
        }
    };

    if tokio::time::timeout(shutdown.timeout(), drain).await.is_err() {
        warn!(timeout = ?shutdown.timeout(), "Graceful shutdown timed out");
    } else {
        info!("Shutdown complete");
    }

    match failure {
        Some(reason) => Err(reason),
        None => Ok(()),
    }
}
