//! FIFO between the arrival path and the batch accumulator.
//!
//! Enqueue never waits: the arrival path runs inside the transport's
//! delivery loop and blocking it would stall delivery for every message.
//! The queue is therefore unbounded; memory is bounded in practice by the
//! accumulator draining it and by the broker's ack-pending limit.

use common::domain::ValidatedReading;
use common::nats::PendingAck;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// A validated reading together with the handle of the message it came from.
#[derive(Debug)]
pub struct QueuedReading {
    pub subject: String,
    pub delivery_attempt: u64,
    pub handle: PendingAck,
    pub reading: ValidatedReading,
}

/// Returned by `enqueue` when the accumulator is gone; hands the item back
/// so the caller can still settle its message.
#[derive(Error, Debug)]
#[error("intake queue is closed")]
pub struct QueueClosed(pub QueuedReading);

/// Result of a bounded-wait dequeue
#[derive(Debug)]
pub enum Dequeued {
    Item(QueuedReading),
    /// Nothing arrived within the wait
    TimedOut,
    /// Every sender is gone and the queue is drained
    Closed,
}

/// Create a connected sender/receiver pair
pub fn intake_queue() -> (IntakeSender, IntakeReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (IntakeSender { tx }, IntakeReceiver { rx })
}

/// Producer side. Cheap to clone; safe to use from many tasks at once.
#[derive(Clone, Debug)]
pub struct IntakeSender {
    tx: mpsc::UnboundedSender<QueuedReading>,
}

impl IntakeSender {
    pub fn enqueue(&self, item: QueuedReading) -> Result<(), QueueClosed> {
        self.tx.send(item).map_err(|e| QueueClosed(e.0))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side, owned by the batch accumulator.
#[derive(Debug)]
pub struct IntakeReceiver {
    rx: mpsc::UnboundedReceiver<QueuedReading>,
}

impl IntakeReceiver {
    /// Wait up to `wait` for the next item.
    ///
    /// Cancel-safe: dropping the future never loses an item.
    pub async fn dequeue_timeout(&mut self, wait: Duration) -> Dequeued {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(item)) => Dequeued::Item(item),
            Ok(None) => Dequeued::Closed,
            Err(_) => Dequeued::TimedOut,
        }
    }

    /// Take an item only if one is immediately available
    pub fn try_dequeue(&mut self) -> Option<QueuedReading> {
        self.rx.try_recv().ok()
    }

    /// Refuse further enqueues; items already queued can still be drained
    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::test_support::{queued, AckLog};

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_times_out_when_empty() {
        let (_tx, mut rx) = intake_queue();

        let started = tokio::time::Instant::now();
        let result = rx.dequeue_timeout(Duration::from_secs(1)).await;

        assert!(matches!(result, Dequeued::TimedOut));
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let log = AckLog::default();
        let (tx, mut rx) = intake_queue();

        for id in ["a", "b", "c"] {
            tx.enqueue(queued(&log, id)).unwrap();
        }
        assert_eq!(rx.len(), 3);

        let mut seen = Vec::new();
        while let Dequeued::Item(item) = rx.dequeue_timeout(Duration::from_millis(10)).await {
            seen.push(item.reading.device_id().to_string());
            item.handle.ack().await.unwrap();
        }

        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_closed_after_all_senders_dropped() {
        let (tx, mut rx) = intake_queue();
        drop(tx);

        assert!(matches!(
            rx.dequeue_timeout(Duration::from_secs(1)).await,
            Dequeued::Closed
        ));
    }

    #[tokio::test]
    async fn test_enqueue_after_close_returns_item() {
        let log = AckLog::default();
        let (tx, mut rx) = intake_queue();
        rx.close();

        let QueueClosed(item) = tx.enqueue(queued(&log, "late")).unwrap_err();
        assert_eq!(item.reading.device_id(), "late");
        assert!(tx.is_closed());

        item.handle.nak().await.unwrap();
        assert_eq!(log.naks(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_producers() {
        let log = AckLog::default();
        let (tx, mut rx) = intake_queue();

        let mut tasks = Vec::new();
        for producer in 0..4 {
            let tx = tx.clone();
            let log = log.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..25 {
                    tx.enqueue(queued(&log, &format!("p{producer}-{i}"))).unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut count = 0;
        while let Some(item) = rx.try_dequeue() {
            item.handle.ack().await.unwrap();
            count += 1;
        }
        assert_eq!(count, 100);
        assert!(rx.is_empty());
    }
}
