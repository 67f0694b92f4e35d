use crate::domain::{validate, IntakeSender, QueueClosed, QueuedReading};
use chrono::Utc;
use common::domain::ValidationError;
use common::nats::{link_remote_parent, IncomingMessage};
use tracing::{debug, error, info_span, warn, Instrument};

const PAYLOAD_PREVIEW_BYTES: usize = 200;

/// What happened to a message on the arrival path
#[derive(Debug, Clone, PartialEq)]
pub enum IntakeOutcome {
    /// Validated and handed to the accumulator; settled later with its batch
    Enqueued,
    /// Failed validation; acked and dropped
    Rejected(ValidationError),
    /// The accumulator is gone; the message was nacked for redelivery
    QueueUnavailable,
}

/// Arrival path: validate each message and either enqueue it or settle it.
///
/// Never waits on the queue, so it is safe to call from the transport's
/// delivery loop.
#[derive(Clone, Debug)]
pub struct ReadingIntake {
    sender: IntakeSender,
}

impl ReadingIntake {
    pub fn new(sender: IntakeSender) -> Self {
        Self { sender }
    }

    pub async fn handle(&self, message: IncomingMessage) -> IntakeOutcome {
        let span = info_span!(
            "reading_intake",
            subject = %message.subject,
            delivery_attempt = message.delivery_attempt,
        );
        link_remote_parent(&span, message.headers.as_ref());

        self.process(message).instrument(span).await
    }

    async fn process(&self, message: IncomingMessage) -> IntakeOutcome {
        let IncomingMessage {
            subject,
            payload,
            delivery_attempt,
            handle,
            ..
        } = message;

        let reading = match validate(&payload, Utc::now()) {
            Ok(reading) => reading,
            Err(e) => {
                // invalid payloads are dead-lettered to the log
                warn!(
                    field = e.field().unwrap_or("payload"),
                    kind = e.kind(),
                    error = %e,
                    payload = %preview(&payload),
                    "dropping invalid reading"
                );
                if let Err(ack_err) = handle.ack().await {
                    error!(error = %ack_err, "failed to acknowledge invalid message");
                }
                return IntakeOutcome::Rejected(e);
            }
        };

        let device_id = reading.device_id().to_string();
        let item = QueuedReading {
            subject,
            delivery_attempt,
            handle,
            reading,
        };

        match self.sender.enqueue(item) {
            Ok(()) => {
                debug!(device_id = %device_id, "reading enqueued");
                IntakeOutcome::Enqueued
            }
            Err(QueueClosed(item)) => {
                error!(
                    device_id = %device_id,
                    "intake queue closed, rejecting message for redelivery"
                );
                if let Err(nak_err) = item.handle.nak().await {
                    error!(error = %nak_err, "failed to reject message");
                }
                IntakeOutcome::QueueUnavailable
            }
        }
    }
}

fn preview(payload: &[u8]) -> String {
    let end = payload.len().min(PAYLOAD_PREVIEW_BYTES);
    let mut text = String::from_utf8_lossy(&payload[..end]).into_owned();
    if payload.len() > end {
        text.push_str("...");
    }
    text
}
