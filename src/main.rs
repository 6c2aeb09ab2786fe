use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use telemetry_ingestor::adapters::{http, mqtt, MqttAdapter, PostgresSensorStore};
use telemetry_ingestor::config::AppConfig;
use telemetry_ingestor::domain::TransportError;
use telemetry_ingestor::ports::TransportHandle;
use telemetry_ingestor::service::{IngestWorker, IngestionPipeline, PersistenceGateway, StatusSurface};
use telemetry_ingestor::state::{ConnectionTracker, MetricsRegistry, ReceivedCounter};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Configuration, then logging at the configured level
    let config = AppConfig::load()?;
    telemetry_ingestor::telemetry::init_logging(&config.verbosity)?;
    info!("Starting telemetry ingestor...");

    // 2. Shared state
    let registry = Arc::new(MetricsRegistry::new());
    let progress = Arc::new(ReceivedCounter::new(config.count));

    // 3. Persistence (lazy: nothing connects until the first reading)
    let gateway = match &config.database_url {
        Some(url) => {
            let store = Arc::new(PostgresSensorStore::new(url.clone()));
            let gateway = PersistenceGateway::new(store, registry.clone(), config.db_write_timeout());
            match config.db_recovery_interval() {
                Some(interval) => gateway.with_recovery_interval(interval),
                None => gateway,
            }
        }
        None => PersistenceGateway::unconfigured(registry.clone()),
    };
    let gateway = Arc::new(gateway);

    // 4. Transport
    let (client, eventloop) = MqttAdapter::build(&config).context("building MQTT client")?;
    let transport = Arc::new(MqttAdapter::new(client));
    let tracker = Arc::new(ConnectionTracker::new(transport.clone(), registry.clone()));

    // 5. Status surface
    let status = StatusSurface::new(tracker.clone(), gateway.clone(), registry.clone());
    let listener = http::bind_with_fallback(config.http_port, config.http_port_attempts).await?;
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    let http_handle = tokio::spawn(http::serve(listener, status, async move {
        let _ = shutdown_rx.wait_for(|stop| *stop).await;
    }));

    // 6. Pipeline: event loop -> bounded queue -> single worker
    let pipeline = Arc::new(IngestionPipeline::new(registry.clone(), gateway.clone(), progress.clone()));
    let (tx, rx) = tokio::sync::mpsc::channel(config.channel_capacity);
    let worker_handle = tokio::spawn(IngestWorker::new(pipeline).run(rx));

    info!(endpoint = %config.endpoint, port = config.port, client_id = %config.client_id, "connecting to MQTT broker");
    tracker.subscribe(&config.topic).await?;
    let mut mqtt_handle: JoinHandle<Result<(), TransportError>> =
        tokio::spawn(mqtt::run_event_loop(eventloop, tracker.clone(), tx));

    if config.count == 0 {
        info!("Listening indefinitely for messages. Press Ctrl+C to exit.");
    } else {
        info!(count = config.count, "Waiting to receive message(s)...");
    }

    // 7. Run until the target is reached, the operator interrupts, or the
    //    event loop dies on a fatal transport error.
    let mut fatal: Option<anyhow::Error> = None;
    let mut loop_finished = false;
    tokio::select! {
        _ = progress.completion().wait() => {
            info!(received = progress.received(), "message(s) received");
        }
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("Interrupted by user."),
            Err(e) => error!(error = %e, "unable to listen for shutdown signal"),
        },
        result = &mut mqtt_handle => {
            loop_finished = true;
            fatal = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.into()),
                Err(e) => Some(anyhow::anyhow!("MQTT event loop panicked: {e}")),
            };
        }
    }

    // 8. Orderly shutdown
    if !loop_finished {
        info!("Disconnecting...");
        if let Err(e) = transport.disconnect().await {
            warn!(error = %e, "disconnect request failed");
        }
        match tokio::time::timeout(Duration::from_secs(5), &mut mqtt_handle).await {
            Ok(Ok(Err(e))) => fatal = Some(e.into()),
            Ok(_) => info!("Disconnected."),
            Err(_) => {
                warn!("Timeout waiting for MQTT event loop, aborting it.");
                mqtt_handle.abort();
            }
        }
    }

    // The event loop owned the only sender, so the worker now drains and stops.
    match tokio::time::timeout(Duration::from_secs(20), worker_handle).await {
        Ok(_) => info!("Ingest worker drained."),
        Err(_) => warn!("Timeout waiting for ingest worker."),
    }

    let _ = shutdown_tx.send(true);
    match http_handle.await {
        Ok(Err(e)) => warn!(error = %e, "HTTP server error"),
        Err(e) => warn!(error = %e, "HTTP server task failed"),
        Ok(Ok(())) => {}
    }

    match fatal {
        Some(e) => {
            error!(error = %e, "Shutdown after fatal error.");
            Err(e)
        }
        None => {
            info!("Shutdown Complete.");
            Ok(())
        }
    }
}
