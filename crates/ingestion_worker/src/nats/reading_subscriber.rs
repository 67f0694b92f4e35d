use crate::domain::ReadingIntake;
use anyhow::{Context, Result};
use async_nats::jetstream;
use common::nats::{JetStreamConsumer, PullConsumer};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const FETCH_ERROR_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ReadingSubscriberConfig {
    pub stream: String,
    pub consumer_name: String,
    pub subject_filter: String,
    /// Most messages pulled per fetch
    pub fetch_batch_size: usize,
    /// Longest a single fetch waits for messages
    pub fetch_wait: Duration,
    /// How long the broker waits for a terminal call before redelivering
    pub ack_wait: Duration,
}

/// Pulls readings from a durable JetStream consumer and hands each one to
/// the intake path, which settles or enqueues it.
pub struct ReadingSubscriber {
    consumer: Box<dyn PullConsumer>,
    config: ReadingSubscriberConfig,
    intake: ReadingIntake,
}

impl ReadingSubscriber {
    /// Create (or bind to) the durable consumer
    pub async fn new(
        jetstream: Arc<dyn JetStreamConsumer>,
        config: ReadingSubscriberConfig,
        intake: ReadingIntake,
    ) -> Result<Self> {
        debug!(
            stream = %config.stream,
            consumer = %config.consumer_name,
            filter_subject = %config.subject_filter,
            "creating reading subscriber"
        );

        let pull_config = jetstream::consumer::pull::Config {
            name: Some(config.consumer_name.clone()),
            durable_name: Some(config.consumer_name.clone()),
            filter_subject: config.subject_filter.clone(),
            ack_policy: jetstream::consumer::AckPolicy::Explicit,
            ack_wait: config.ack_wait,
            ..Default::default()
        };

        let consumer = jetstream
            .create_consumer(pull_config, &config.stream)
            .await
            .context("failed to create reading consumer")?;

        info!(
            stream = %config.stream,
            consumer = %config.consumer_name,
            "reading subscriber ready"
        );

        Ok(Self {
            consumer,
            config,
            intake,
        })
    }

    /// Run the fetch loop until cancellation.
    ///
    /// A fetch in progress is allowed to finish (it is bounded by
    /// `fetch_wait`) so every fetched handle reaches the intake path.
    pub async fn run(self, ctx: CancellationToken) -> Result<()> {
        debug!(
            stream = %self.config.stream,
            consumer = %self.config.consumer_name,
            "starting reading subscriber"
        );

        while !ctx.is_cancelled() {
            if let Err(e) = self.fetch_and_dispatch().await {
                error!(
                    stream = %self.config.stream,
                    consumer = %self.config.consumer_name,
                    error = %e,
                    "error fetching readings"
                );
                tokio::select! {
                    _ = ctx.cancelled() => {}
                    _ = tokio::time::sleep(FETCH_ERROR_DELAY) => {}
                }
            }
        }

        info!(
            stream = %self.config.stream,
            consumer = %self.config.consumer_name,
            "received shutdown signal, reading subscriber stopped"
        );
        Ok(())
    }

    /// Fetch one batch and dispatch every message in arrival order.
    /// Returns the number of messages fetched.
    pub async fn fetch_and_dispatch(&self) -> Result<usize> {
        let messages = self
            .consumer
            .fetch_messages(self.config.fetch_batch_size, self.config.fetch_wait)
            .await?;

        if messages.is_empty() {
            debug!("no readings in fetch");
            return Ok(0);
        }

        let count = messages.len();
        debug!(message_count = count, "received readings");

        for message in messages {
            self.intake.handle(message).await;
        }

        Ok(count)
    }
}
