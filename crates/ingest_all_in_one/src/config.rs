use common::postgres::PostgresConfig;
use common::telemetry::TelemetryConfig;
use config::{Config, ConfigError, Environment};
use ingestion_worker::{BatchAccumulatorConfig, ReadingSubscriberConfig, SensorDemoProducerConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // NATS configuration
    /// NATS server URL
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// JetStream stream carrying raw readings
    #[serde(default = "default_nats_stream")]
    pub nats_stream: String,

    /// Subject filter for the reading consumer
    #[serde(default = "default_nats_subject")]
    pub nats_subject: String,

    /// Durable consumer name
    #[serde(default = "default_nats_consumer_name")]
    pub nats_consumer_name: String,

    /// Most messages pulled per fetch
    #[serde(default = "default_nats_fetch_batch_size")]
    pub nats_fetch_batch_size: usize,

    /// Max wait for a fetch in milliseconds
    #[serde(default = "default_nats_fetch_wait_ms")]
    pub nats_fetch_wait_ms: u64,

    /// Seconds the broker waits for an ack before redelivering
    #[serde(default = "default_nats_ack_wait_secs")]
    pub nats_ack_wait_secs: u64,

    /// Startup timeout for initialization operations in seconds
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    // Batching
    /// Readings per batch write
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seconds after the last flush before a partial batch is written
    #[serde(default = "default_batch_timeout_secs")]
    pub batch_timeout_secs: u64,

    /// Longest single wait on the intake queue in milliseconds
    #[serde(default = "default_batch_poll_interval_ms")]
    pub batch_poll_interval_ms: u64,

    /// First backoff after the database is found unreachable
    #[serde(default = "default_sink_backoff_initial_ms")]
    pub sink_backoff_initial_ms: u64,

    /// Backoff ceiling
    #[serde(default = "default_sink_backoff_max_ms")]
    pub sink_backoff_max_ms: u64,

    // PostgreSQL configuration
    #[serde(default = "default_postgres_host")]
    pub postgres_host: String,

    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,

    #[serde(default = "default_postgres_database")]
    pub postgres_database: String,

    #[serde(default = "default_postgres_username")]
    pub postgres_username: String,

    #[serde(default = "default_postgres_password")]
    pub postgres_password: String,

    /// Timeout for a single connection attempt in seconds
    #[serde(default = "default_postgres_connect_timeout_secs")]
    pub postgres_connect_timeout_secs: u64,

    /// Connection attempts at startup before giving up
    #[serde(default = "default_postgres_startup_attempts")]
    pub postgres_startup_attempts: u32,

    /// Delay between startup connection attempts in seconds
    #[serde(default = "default_postgres_startup_retry_delay_secs")]
    pub postgres_startup_retry_delay_secs: u64,

    // Demo producer
    /// Publish random readings to the stream
    #[serde(default)]
    pub demo_producer_enabled: bool,

    #[serde(default = "default_demo_producer_interval_ms")]
    pub demo_producer_interval_ms: u64,

    /// Device ids used by the demo producer (comma-separated)
    #[serde(default = "default_demo_producer_device_ids")]
    pub demo_producer_device_ids: String,

    // OpenTelemetry configuration
    /// OpenTelemetry OTLP endpoint (gRPC)
    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    /// Enable OpenTelemetry export
    #[serde(default)]
    pub otel_enabled: bool,

    /// Service name for OpenTelemetry resource
    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_nats_stream() -> String {
    "sensor_readings".to_string()
}

fn default_nats_subject() -> String {
    "sensor_readings.>".to_string()
}

fn default_nats_consumer_name() -> String {
    "sensor-ingest".to_string()
}

fn default_nats_fetch_batch_size() -> usize {
    100
}

fn default_nats_fetch_wait_ms() -> u64 {
    1000
}

fn default_nats_ack_wait_secs() -> u64 {
    30
}

fn default_startup_timeout_secs() -> u64 {
    10
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_timeout_secs() -> u64 {
    5
}

fn default_batch_poll_interval_ms() -> u64 {
    1000
}

fn default_sink_backoff_initial_ms() -> u64 {
    1000
}

fn default_sink_backoff_max_ms() -> u64 {
    30_000
}

fn default_postgres_host() -> String {
    "localhost".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_database() -> String {
    "iot_data".to_string()
}

fn default_postgres_username() -> String {
    "postgres".to_string()
}

fn default_postgres_password() -> String {
    "postgres".to_string()
}

fn default_postgres_connect_timeout_secs() -> u64 {
    5
}

fn default_postgres_startup_attempts() -> u32 {
    10
}

fn default_postgres_startup_retry_delay_secs() -> u64 {
    5
}

fn default_demo_producer_interval_ms() -> u64 {
    1000
}

fn default_demo_producer_device_ids() -> String {
    "sensor-001,sensor-002,sensor-003".to_string()
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_service_name() -> String {
    "sensor-ingest".to_string()
}

impl ServiceConfig {
    /// Load configuration from `INGEST_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let config: Self = Config::builder()
            .add_source(Environment::with_prefix("INGEST"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Message(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.postgres_startup_attempts == 0 {
            return Err(ConfigError::Message(
                "postgres_startup_attempts must be at least 1".to_string(),
            ));
        }
        if self.demo_producer_enabled && self.demo_device_ids().is_empty() {
            return Err(ConfigError::Message(
                "demo_producer_device_ids is empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn postgres(&self) -> PostgresConfig {
        PostgresConfig {
            host: self.postgres_host.clone(),
            port: self.postgres_port,
            database: self.postgres_database.clone(),
            username: self.postgres_username.clone(),
            password: self.postgres_password.clone(),
            connect_timeout_secs: self.postgres_connect_timeout_secs,
        }
    }

    pub fn telemetry(&self) -> TelemetryConfig {
        let telemetry = TelemetryConfig::new(&self.otel_service_name, &self.log_level);
        if self.otel_enabled {
            telemetry.with_otlp_export(&self.otel_endpoint)
        } else {
            telemetry
        }
    }

    pub fn subscriber(&self) -> ReadingSubscriberConfig {
        ReadingSubscriberConfig {
            stream: self.nats_stream.clone(),
            consumer_name: self.nats_consumer_name.clone(),
            subject_filter: self.nats_subject.clone(),
            fetch_batch_size: self.nats_fetch_batch_size,
            fetch_wait: Duration::from_millis(self.nats_fetch_wait_ms),
            ack_wait: Duration::from_secs(self.nats_ack_wait_secs),
        }
    }

    pub fn accumulator(&self) -> BatchAccumulatorConfig {
        BatchAccumulatorConfig {
            batch_size: self.batch_size,
            batch_timeout: Duration::from_secs(self.batch_timeout_secs),
            poll_interval: Duration::from_millis(self.batch_poll_interval_ms),
            backoff_initial: Duration::from_millis(self.sink_backoff_initial_ms),
            backoff_max: Duration::from_millis(self.sink_backoff_max_ms),
        }
    }

    pub fn demo_device_ids(&self) -> Vec<String> {
        self.demo_producer_device_ids
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn demo_producer(&self) -> SensorDemoProducerConfig {
        SensorDemoProducerConfig {
            base_subject: self.nats_stream.clone(),
            interval_ms: self.demo_producer_interval_ms,
            device_ids: self.demo_device_ids(),
        }
    }
}
