use crate::domain::{intake_queue, BatchAccumulator, BatchAccumulatorConfig, ReadingIntake};
use crate::nats::{ReadingSubscriber, ReadingSubscriberConfig};
use common::domain::SensorReadingRepository;
use common::nats::JetStreamConsumer;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub type ProcessFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type WorkerProcess = Box<dyn FnOnce(CancellationToken) -> ProcessFuture + Send>;

fn process<F, Fut>(run: F) -> WorkerProcess
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move |ctx| -> ProcessFuture { Box::pin(run(ctx)) })
}

#[derive(Debug, Clone)]
pub struct IngestionWorkerConfig {
    pub subscriber: ReadingSubscriberConfig,
    pub accumulator: BatchAccumulatorConfig,
}

/// The pipeline from subscription to store: subscriber, intake queue and
/// batch accumulator, wired together and run as two processes.
pub struct IngestionWorker {
    subscriber: ReadingSubscriber,
    accumulator: BatchAccumulator,
}

impl IngestionWorker {
    pub async fn new(
        consumer_client: Arc<dyn JetStreamConsumer>,
        repository: Arc<dyn SensorReadingRepository>,
        config: IngestionWorkerConfig,
    ) -> anyhow::Result<Self> {
        info!("Initializing ingestion worker");

        let (sender, receiver) = intake_queue();
        let accumulator = BatchAccumulator::new(receiver, repository, config.accumulator);
        let subscriber =
            ReadingSubscriber::new(consumer_client, config.subscriber, ReadingIntake::new(sender))
                .await?;

        info!("Ingestion worker initialized");

        Ok(Self {
            subscriber,
            accumulator,
        })
    }

    /// Named processes for the runner; both stop on the shared token
    pub fn into_runner_processes(self) -> Vec<(&'static str, WorkerProcess)> {
        let subscriber = self.subscriber;
        let accumulator = self.accumulator;
        vec![
            ("reading_subscriber", process(move |ctx| subscriber.run(ctx))),
            ("batch_accumulator", process(move |ctx| accumulator.run(ctx))),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{MockJetStreamConsumer, MockPullConsumer, MockSensorReadingRepository};
    use std::time::Duration;

    fn config() -> IngestionWorkerConfig {
        IngestionWorkerConfig {
            subscriber: ReadingSubscriberConfig {
                stream: "sensor_readings".to_string(),
                consumer_name: "sensor-ingest".to_string(),
                subject_filter: "sensor_readings.>".to_string(),
                fetch_batch_size: 10,
                fetch_wait: Duration::from_secs(1),
                ack_wait: Duration::from_secs(30),
            },
            accumulator: BatchAccumulatorConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_worker_exposes_named_processes() {
        let mut mock_jetstream = MockJetStreamConsumer::new();
        mock_jetstream
            .expect_create_consumer()
            .times(1)
            .returning(|_, _| Ok(Box::new(MockPullConsumer::new())));

        let worker = IngestionWorker::new(
            Arc::new(mock_jetstream),
            Arc::new(MockSensorReadingRepository::new()),
            config(),
        )
        .await
        .unwrap();

        let names: Vec<_> = worker
            .into_runner_processes()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["reading_subscriber", "batch_accumulator"]);
    }

    #[tokio::test]
    async fn test_consumer_failure_fails_construction() {
        let mut mock_jetstream = MockJetStreamConsumer::new();
        mock_jetstream
            .expect_create_consumer()
            .returning(|_, _| Err(anyhow::anyhow!("jetstream unavailable")));

        let result = IngestionWorker::new(
            Arc::new(mock_jetstream),
            Arc::new(MockSensorReadingRepository::new()),
            config(),
        )
        .await;

        assert!(result.is_err());
    }
}
