use crate::domain::{
    flush_trigger, settle_batch, Batch, BatchMessage, Dequeued, FlushTrigger, IntakeReceiver,
};
use common::domain::SensorReadingRepository;
use common::nats::Disposition;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone)]
pub struct BatchAccumulatorConfig {
    /// Flush as soon as this many readings are buffered
    pub batch_size: usize,
    /// Flush a non-empty batch once this long has passed since the last flush
    pub batch_timeout: Duration,
    /// Upper bound on a single wait for the next reading
    pub poll_interval: Duration,
    /// First pause after the store reports it is unreachable
    pub backoff_initial: Duration,
    /// Ceiling for the doubling pause
    pub backoff_max: Duration,
}

impl Default for BatchAccumulatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Result of one flush attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Rows written and every message acked
    Persisted { rows: u64 },
    /// The store rejected the batch; every message nacked
    WriteFailed,
    /// The store was unreachable; every message nacked
    NotConnected,
}

/// Single consumer of the intake queue.
///
/// Buffers readings and writes them in one call when the batch is full or
/// the batch timeout has elapsed, then settles every message of the batch
/// the same way: ack after a successful write, nak otherwise.
pub struct BatchAccumulator {
    receiver: IntakeReceiver,
    repository: Arc<dyn SensorReadingRepository>,
    config: BatchAccumulatorConfig,
    batch: Batch,
    last_flush: Instant,
    backoff: Option<Duration>,
}

impl BatchAccumulator {
    pub fn new(
        receiver: IntakeReceiver,
        repository: Arc<dyn SensorReadingRepository>,
        mut config: BatchAccumulatorConfig,
    ) -> Self {
        config.batch_size = config.batch_size.max(1);
        Self {
            receiver,
            repository,
            batch: Batch::with_capacity(config.batch_size),
            config,
            last_flush: Instant::now(),
            backoff: None,
        }
    }

    /// Run until cancelled or until every producer is gone.
    ///
    /// A flush in progress always runs to completion. On exit the in-flight
    /// batch gets one last flush and anything still queued is nacked.
    pub async fn run(mut self, ctx: CancellationToken) -> anyhow::Result<()> {
        info!(
            batch_size = self.config.batch_size,
            batch_timeout_ms = self.config.batch_timeout.as_millis() as u64,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "starting batch accumulator"
        );
        self.last_flush = Instant::now();

        loop {
            let dequeued = tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    info!("received shutdown signal, stopping batch accumulator");
                    break;
                }
                dequeued = self.receiver.dequeue_timeout(self.config.poll_interval) => dequeued,
            };

            match dequeued {
                Dequeued::Item(item) => self.batch.push(item),
                Dequeued::TimedOut => {}
                Dequeued::Closed => {
                    info!("intake queue closed, stopping batch accumulator");
                    break;
                }
            }

            let Some(trigger) = flush_trigger(
                self.batch.len(),
                self.config.batch_size,
                self.last_flush.elapsed(),
                self.config.batch_timeout,
            ) else {
                continue;
            };

            if self.flush(trigger).await == FlushOutcome::NotConnected {
                let delay = self.next_backoff();
                warn!(
                    backoff_ms = delay.as_millis() as u64,
                    "database unavailable, backing off before next batch"
                );
                tokio::select! {
                    _ = ctx.cancelled() => {
                        info!("received shutdown signal during backoff");
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            } else {
                self.backoff = None;
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Write the current batch and settle its messages.
    ///
    /// The batch is cleared whatever the outcome. The batch timeout restarts
    /// when the flush begins, not when the write and settlement finish.
    pub async fn flush(&mut self, trigger: FlushTrigger) -> FlushOutcome {
        self.last_flush = Instant::now();
        let (messages, readings) = self.batch.take();
        let size = readings.len();
        let span = info_span!("flush_batch", trigger = trigger.as_str(), batch_size = size);

        async {
            match self.repository.insert_batch(&readings).await {
                Ok(rows) => {
                    info!(rows, "batch persisted");
                    settle_batch(messages, Disposition::Ack).await;
                    FlushOutcome::Persisted { rows }
                }
                Err(e) => {
                    // the whole batch is redelivered, so one bad row stalls its neighbours
                    error!(
                        error = %e,
                        max_delivery_attempt = max_delivery_attempt(&messages),
                        "batch write failed, rejecting messages for redelivery"
                    );
                    settle_batch(messages, Disposition::Nak).await;
                    if e.is_not_connected() {
                        FlushOutcome::NotConnected
                    } else {
                        FlushOutcome::WriteFailed
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    fn next_backoff(&mut self) -> Duration {
        let delay = match self.backoff {
            None => self.config.backoff_initial,
            Some(previous) => previous.saturating_mul(2).min(self.config.backoff_max),
        };
        self.backoff = Some(delay);
        delay
    }

    async fn shutdown(mut self) {
        if !self.batch.is_empty() {
            self.flush(FlushTrigger::Shutdown).await;
        }

        self.receiver.close();
        let mut leftovers = Vec::new();
        while let Some(item) = self.receiver.try_dequeue() {
            leftovers.push(BatchMessage {
                subject: item.subject,
                delivery_attempt: item.delivery_attempt,
                handle: item.handle,
            });
        }

        if !leftovers.is_empty() {
            info!(
                count = leftovers.len(),
                "rejecting queued readings for redelivery on shutdown"
            );
            settle_batch(leftovers, Disposition::Nak).await;
        }

        debug!("batch accumulator stopped");
    }
}

fn max_delivery_attempt(messages: &[BatchMessage]) -> u64 {
    messages
        .iter()
        .map(|m| m.delivery_attempt)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::intake_queue;
    use crate::domain::test_support::{queued, AckLog};
    use common::domain::{RepositoryError, RepositoryResult, ValidatedReading};
    use common::MockSensorReadingRepository;
    use std::sync::Mutex;

    type Calls = Arc<Mutex<Vec<(usize, Duration)>>>;

    fn config(batch_size: usize) -> BatchAccumulatorConfig {
        BatchAccumulatorConfig {
            batch_size,
            ..Default::default()
        }
    }

    /// Mock that records (batch length, time since test start) for each call
    /// and answers from `results` in order
    fn scripted_repository(
        results: Vec<fn(usize) -> Result<u64, RepositoryError>>,
        calls: Calls,
    ) -> MockSensorReadingRepository {
        let start = Instant::now();
        let mut mock = MockSensorReadingRepository::new();
        let mut results = results.into_iter();
        let expected = results.len();
        mock.expect_insert_batch()
            .times(expected)
            .returning(move |readings| {
                calls.lock().unwrap().push((readings.len(), start.elapsed()));
                let result = results.next().unwrap();
                result(readings.len())
            });
        mock
    }

    /// Store whose writes take `write_time` to complete
    struct SlowRepository {
        write_time: Duration,
        start: Instant,
        calls: Calls,
    }

    #[async_trait::async_trait]
    impl SensorReadingRepository for SlowRepository {
        async fn insert_batch(&self, readings: &[ValidatedReading]) -> RepositoryResult<u64> {
            self.calls
                .lock()
                .unwrap()
                .push((readings.len(), self.start.elapsed()));
            tokio::time::sleep(self.write_time).await;
            Ok(readings.len() as u64)
        }
    }

    fn ok(len: usize) -> Result<u64, RepositoryError> {
        Ok(len as u64)
    }

    fn not_connected(_: usize) -> Result<u64, RepositoryError> {
        Err(RepositoryError::NotConnected("connection refused".to_string()))
    }

    fn write_failed(_: usize) -> Result<u64, RepositoryError> {
        Err(RepositoryError::WriteFailed(anyhow::anyhow!(
            "violates check constraint"
        )))
    }

    fn assert_settled_once(log: &AckLog, ids: &[String]) {
        for id in ids {
            assert_eq!(log.dispositions_for(id).len(), 1, "{id} settled once");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_flushes_before_timeout() {
        let log = AckLog::default();
        let calls = Calls::default();
        let (tx, rx) = intake_queue();
        let ids: Vec<String> = (0..10).map(|i| format!("d{i}")).collect();
        for id in &ids {
            tx.enqueue(queued(&log, id)).unwrap();
        }

        let repository = scripted_repository(vec![ok], calls.clone());
        let accumulator = BatchAccumulator::new(rx, Arc::new(repository), config(10));
        let ctx = CancellationToken::new();
        let handle = tokio::spawn(accumulator.run(ctx.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        ctx.cancel();
        handle.await.unwrap().unwrap();

        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, 10);
        assert!(calls[0].1 < Duration::from_secs(5));
        assert_eq!(log.acks(), 10);
        assert_eq!(log.naks(), 0);
        assert_settled_once(&log, &ids);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_reading_flushes_after_timeout() {
        let log = AckLog::default();
        let calls = Calls::default();
        let (tx, rx) = intake_queue();
        tx.enqueue(queued(&log, "d1")).unwrap();

        let repository = scripted_repository(vec![ok], calls.clone());
        let accumulator = BatchAccumulator::new(rx, Arc::new(repository), config(10));
        let ctx = CancellationToken::new();
        let handle = tokio::spawn(accumulator.run(ctx.clone()));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(calls.lock().unwrap().is_empty());
        assert!(log.events().is_empty());

        tokio::time::sleep(Duration::from_secs(3)).await;
        ctx.cancel();
        handle.await.unwrap().unwrap();

        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, 1);
        assert!(calls[0].1 >= Duration::from_secs(5));
        assert_eq!(log.dispositions_for("d1"), vec![Disposition::Ack]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_from_run_start() {
        let log = AckLog::default();
        let calls = Calls::default();
        let (tx, rx) = intake_queue();

        let repository = scripted_repository(vec![ok], calls.clone());
        let accumulator = BatchAccumulator::new(rx, Arc::new(repository), config(10));

        // built well before it is started
        tokio::time::sleep(Duration::from_secs(4)).await;
        let ctx = CancellationToken::new();
        let handle = tokio::spawn(accumulator.run(ctx.clone()));
        tx.enqueue(queued(&log, "d1")).unwrap();

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert!(calls.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        ctx.cancel();
        handle.await.unwrap().unwrap();

        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].1 >= Duration::from_secs(9));
        assert_eq!(log.dispositions_for("d1"), vec![Disposition::Ack]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_restarts_when_flush_begins() {
        let log = AckLog::default();
        let calls = Calls::default();
        let (tx, rx) = intake_queue();
        let repository = SlowRepository {
            write_time: Duration::from_secs(3),
            start: Instant::now(),
            calls: calls.clone(),
        };
        let accumulator = BatchAccumulator::new(rx, Arc::new(repository), config(10));
        let ctx = CancellationToken::new();
        let handle = tokio::spawn(accumulator.run(ctx.clone()));

        tx.enqueue(queued(&log, "a")).unwrap();
        // first flush starts at 5s and its write runs until 8s
        tokio::time::sleep(Duration::from_secs(6)).await;
        tx.enqueue(queued(&log, "b")).unwrap();

        tokio::time::sleep(Duration::from_secs(8)).await;
        ctx.cancel();
        handle.await.unwrap().unwrap();

        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].1 >= Duration::from_secs(5) && calls[0].1 < Duration::from_secs(6));
        // 5s after the first flush began, not 5s after its write finished
        assert!(calls[1].1 >= Duration::from_secs(10) && calls[1].1 < Duration::from_secs(11));
        assert_eq!(log.acks(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_accumulator_never_writes() {
        let (_tx, rx) = intake_queue();
        let mut repository = MockSensorReadingRepository::new();
        repository.expect_insert_batch().times(0);

        let accumulator = BatchAccumulator::new(rx, Arc::new(repository), config(10));
        let ctx = CancellationToken::new();
        let handle = tokio::spawn(accumulator.run(ctx.clone()));

        tokio::time::sleep(Duration::from_secs(30)).await;
        ctx.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_naks_whole_batch() {
        let log = AckLog::default();
        let calls = Calls::default();
        let (tx, rx) = intake_queue();
        let ids: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        for id in &ids {
            tx.enqueue(queued(&log, id)).unwrap();
        }

        let repository = scripted_repository(vec![write_failed], calls.clone());
        let accumulator = BatchAccumulator::new(rx, Arc::new(repository), config(3));
        let ctx = CancellationToken::new();
        let handle = tokio::spawn(accumulator.run(ctx.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        ctx.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(log.naks(), 3);
        assert_eq!(log.acks(), 0);
        assert_settled_once(&log, &ids);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_connected_backs_off_exponentially() {
        let log = AckLog::default();
        let calls = Calls::default();
        let (tx, rx) = intake_queue();
        for id in ["a", "b", "c"] {
            tx.enqueue(queued(&log, id)).unwrap();
        }

        let repository =
            scripted_repository(vec![not_connected, not_connected, ok], calls.clone());
        let accumulator = BatchAccumulator::new(rx, Arc::new(repository), config(1));
        let ctx = CancellationToken::new();
        let handle = tokio::spawn(accumulator.run(ctx.clone()));

        tokio::time::sleep(Duration::from_secs(10)).await;
        ctx.cancel();
        handle.await.unwrap().unwrap();

        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        assert!(calls[1].1 - calls[0].1 >= Duration::from_secs(1));
        assert!(calls[2].1 - calls[1].1 >= Duration::from_secs(2));

        assert_eq!(log.dispositions_for("a"), vec![Disposition::Nak]);
        assert_eq!(log.dispositions_for("b"), vec![Disposition::Nak]);
        assert_eq!(log.dispositions_for("c"), vec![Disposition::Ack]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_success() {
        let log = AckLog::default();
        let calls = Calls::default();
        let (tx, rx) = intake_queue();
        for id in ["a", "b", "c", "d"] {
            tx.enqueue(queued(&log, id)).unwrap();
        }

        let repository = scripted_repository(
            vec![not_connected, ok, not_connected, ok],
            calls.clone(),
        );
        let accumulator = BatchAccumulator::new(rx, Arc::new(repository), config(1));
        let ctx = CancellationToken::new();
        let handle = tokio::spawn(accumulator.run(ctx.clone()));

        tokio::time::sleep(Duration::from_secs(10)).await;
        ctx.cancel();
        handle.await.unwrap().unwrap();

        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 4);
        let third_gap = calls[3].1 - calls[2].1;
        assert!(third_gap >= Duration::from_secs(1));
        assert!(third_gap < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_capped() {
        let (_tx, rx) = intake_queue();
        let mut repository = MockSensorReadingRepository::new();
        repository.expect_insert_batch().times(0);
        let mut accumulator = BatchAccumulator::new(
            rx,
            Arc::new(repository),
            BatchAccumulatorConfig {
                backoff_initial: Duration::from_secs(1),
                backoff_max: Duration::from_secs(5),
                ..Default::default()
            },
        );

        let delays: Vec<u64> = (0..5).map(|_| accumulator.next_backoff().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_in_flight_and_naks_queued() {
        let log = AckLog::default();
        let calls = Calls::default();
        let (tx, rx) = intake_queue();
        for id in ["a", "b", "c"] {
            tx.enqueue(queued(&log, id)).unwrap();
        }

        let repository = scripted_repository(vec![ok], calls.clone());
        let accumulator = BatchAccumulator::new(rx, Arc::new(repository), config(10));
        let ctx = CancellationToken::new();
        let handle = tokio::spawn(accumulator.run(ctx.clone()));

        // let the accumulator pull the first three into its batch
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(calls.lock().unwrap().is_empty());

        // queued after cancellation, so never batched
        ctx.cancel();
        tx.enqueue(queued(&log, "x")).unwrap();
        tx.enqueue(queued(&log, "y")).unwrap();
        handle.await.unwrap().unwrap();

        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, 3);
        for id in ["a", "b", "c"] {
            assert_eq!(log.dispositions_for(id), vec![Disposition::Ack]);
        }
        for id in ["x", "y"] {
            assert_eq!(log.dispositions_for(id), vec![Disposition::Nak]);
        }

        assert!(tx.is_closed());
        assert!(tx.enqueue(queued(&log, "z")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_producers_are_gone() {
        let log = AckLog::default();
        let calls = Calls::default();
        let (tx, rx) = intake_queue();
        tx.enqueue(queued(&log, "last")).unwrap();
        drop(tx);

        let repository = scripted_repository(vec![ok], calls.clone());
        let accumulator = BatchAccumulator::new(rx, Arc::new(repository), config(10));

        accumulator.run(CancellationToken::new()).await.unwrap();

        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(log.dispositions_for("last"), vec![Disposition::Ack]);
    }

    #[test]
    fn test_max_delivery_attempt() {
        assert_eq!(max_delivery_attempt(&[]), 0);
    }
}
