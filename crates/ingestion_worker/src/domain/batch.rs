use crate::domain::QueuedReading;
use common::domain::ValidatedReading;
use common::nats::PendingAck;
use std::time::Duration;

/// Message-side half of a batch entry: what is needed to settle it
#[derive(Debug)]
pub struct BatchMessage {
    pub subject: String,
    pub delivery_attempt: u64,
    pub handle: PendingAck,
}

/// Readings accumulated between two flushes.
///
/// Messages and readings are kept in parallel, in arrival order, so the
/// readings can be handed to the repository as one slice.
#[derive(Debug, Default)]
pub struct Batch {
    messages: Vec<BatchMessage>,
    readings: Vec<ValidatedReading>,
}

impl Batch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: Vec::with_capacity(capacity),
            readings: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, item: QueuedReading) {
        self.messages.push(BatchMessage {
            subject: item.subject,
            delivery_attempt: item.delivery_attempt,
            handle: item.handle,
        });
        self.readings.push(item.reading);
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Empty the batch, returning its contents
    pub fn take(&mut self) -> (Vec<BatchMessage>, Vec<ValidatedReading>) {
        (
            std::mem::take(&mut self.messages),
            std::mem::take(&mut self.readings),
        )
    }
}

/// Why a batch is being flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The batch reached the configured size
    Full,
    /// The batch timeout elapsed since the last flush
    TimedOut,
    /// The accumulator is shutting down
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::TimedOut => "timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Decide whether a batch of `len` readings must be flushed.
///
/// Size and time are alternatives of one check: when both hold the batch is
/// flushed once, reported as `Full`. An empty batch never flushes.
pub fn flush_trigger(
    len: usize,
    batch_size: usize,
    since_last_flush: Duration,
    batch_timeout: Duration,
) -> Option<FlushTrigger> {
    if len == 0 {
        None
    } else if len >= batch_size {
        Some(FlushTrigger::Full)
    } else if since_last_flush >= batch_timeout {
        Some(FlushTrigger::TimedOut)
    } else {
        None
    }
}
