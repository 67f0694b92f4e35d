use anyhow::{bail, Context, Result};
use chrono::Utc;
use common::nats::JetStreamPublisher;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

/// Configuration for the sensor reading demo producer
#[derive(Debug, Clone)]
pub struct SensorDemoProducerConfig {
    pub base_subject: String,
    pub interval_ms: u64,
    pub device_ids: Vec<String>,
}

/// Wire shape of a reading as a device would publish it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorPayload {
    pub device_id: String,
    pub timestamp_utc: String,
    pub temperature_celsius: f64,
    pub humidity_percent: f64,
}

impl SensorPayload {
    /// A plausible reading for `device_id`, stamped now
    pub fn random(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            // naive UTC, the way field devices report it
            timestamp_utc: Utc::now()
                .naive_utc()
                .format("%Y-%m-%dT%H:%M:%S%.6f")
                .to_string(),
            temperature_celsius: round2(uniform(-10.0, 40.0)),
            humidity_percent: round2(uniform(20.0, 90.0)),
        }
    }
}

fn uniform(min: f64, max: f64) -> f64 {
    rand::thread_rng().gen_range(min..=max)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Publish one random reading per interval until cancelled.
///
/// Publish failures are logged and the loop carries on.
pub async fn run_sensor_demo_producer(
    jetstream: Arc<dyn JetStreamPublisher>,
    config: SensorDemoProducerConfig,
    ctx: CancellationToken,
) -> Result<()> {
    if config.device_ids.is_empty() {
        bail!("demo producer needs at least one device id");
    }

    info!(
        base_subject = %config.base_subject,
        interval_ms = config.interval_ms,
        devices = config.device_ids.len(),
        "Starting sensor demo producer"
    );

    let mut ticker = interval(Duration::from_millis(config.interval_ms.max(1)));
    let mut published: u64 = 0;

    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                info!(published, "sensor demo producer stopped");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        let index = rand::thread_rng().gen_range(0..config.device_ids.len());
        let device_id = &config.device_ids[index];
        let payload = SensorPayload::random(device_id);
        let encoded = serde_json::to_vec(&payload).context("Failed to encode demo reading")?;
        let subject = format!("{}.{}", config.base_subject, device_id);

        let span = info_span!("publish_demo_reading", subject = %subject);
        match jetstream
            .publish(subject.clone(), encoded.into())
            .instrument(span)
            .await
        {
            Ok(()) => {
                published += 1;
                debug!(
                    subject = %subject,
                    device_id = %device_id,
                    temperature_celsius = payload.temperature_celsius,
                    humidity_percent = payload.humidity_percent,
                    "Published demo reading"
                );
            }
            Err(e) => {
                error!(subject = %subject, error = %e, "Failed to publish demo reading");
            }
        }
    }
}
