mod config;

use common::nats::NatsClient;
use common::postgres::{PostgresConnection, PostgresSensorReadingRepository};
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryProviders};
use crate::config::ServiceConfig;
use ingest_runner::Runner;
use ingestion_worker::{run_sensor_demo_producer, IngestionWorker, IngestionWorkerConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let telemetry_providers: Option<TelemetryProviders> = match init_telemetry(&config.telemetry()) {
        Ok(providers) => providers,
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        otel_enabled = config.otel_enabled,
        otel_endpoint = %config.otel_endpoint,
        "Starting sensor ingest service"
    );
    debug!("Configuration: {:?}", config);

    // The database must be reachable before anything is consumed
    let repository = match connect_postgres(&config).await {
        Ok(repository) => repository,
        Err(e) => {
            error!("Failed to connect to PostgreSQL: {:#}", e);
            shutdown_telemetry(telemetry_providers);
            std::process::exit(1);
        }
    };

    let nats_client = match connect_nats(&config).await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to initialize NATS: {:#}", e);
            shutdown_telemetry(telemetry_providers);
            std::process::exit(1);
        }
    };

    let worker = match IngestionWorker::new(
        nats_client.create_consumer_client(),
        repository,
        IngestionWorkerConfig {
            subscriber: config.subscriber(),
            accumulator: config.accumulator(),
        },
    )
    .await
    {
        Ok(worker) => worker,
        Err(e) => {
            error!("Failed to initialize ingestion worker: {:#}", e);
            shutdown_telemetry(telemetry_providers);
            std::process::exit(1);
        }
    };

    let mut runner = Runner::new();
    for (name, process) in worker.into_runner_processes() {
        runner = runner.with_named_process(name, process);
    }

    if config.demo_producer_enabled {
        let publisher = nats_client.create_publisher_client();
        let demo_config = config.demo_producer();
        info!(devices = demo_config.device_ids.len(), "Demo producer enabled");
        runner = runner.with_named_process("sensor_demo_producer", move |ctx| {
            run_sensor_demo_producer(publisher, demo_config, ctx)
        });
    }

    runner = runner
        .with_closer(move || async move {
            info!("Running cleanup tasks...");
            match Arc::try_unwrap(nats_client) {
                Ok(client) => client.close().await,
                Err(_) => debug!("NATS client still shared, skipping flush"),
            }

            // Flush pending traces and logs
            shutdown_telemetry(telemetry_providers);

            info!("Cleanup complete");
            Ok(())
        })
        .with_closer_timeout(Duration::from_secs(10));

    runner.run().await;
}

async fn connect_postgres(
    config: &ServiceConfig,
) -> anyhow::Result<Arc<PostgresSensorReadingRepository>> {
    info!(
        host = %config.postgres_host,
        port = config.postgres_port,
        database = %config.postgres_database,
        "Initializing PostgreSQL..."
    );

    let mut connection = PostgresConnection::new(config.postgres());
    connection
        .connect_with_retry(
            config.postgres_startup_attempts,
            Duration::from_secs(config.postgres_startup_retry_delay_secs),
        )
        .await?;

    Ok(Arc::new(PostgresSensorReadingRepository::new(connection)))
}

async fn connect_nats(config: &ServiceConfig) -> anyhow::Result<NatsClient> {
    info!("Initializing NATS...");
    let client = NatsClient::connect(
        &config.nats_url,
        Duration::from_secs(config.startup_timeout_secs),
    )
    .await?;
    client.ensure_stream(&config.nats_stream).await?;
    Ok(client)
}
