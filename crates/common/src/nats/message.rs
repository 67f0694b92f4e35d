use anyhow::Result;
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use tracing::error;

/// Transport-side capability to settle one delivered message.
///
/// Implementations talk to the broker; callers never use this directly but
/// go through `PendingAck`, which guarantees at most one terminal call.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Processed: do not redeliver
    async fn ack(&self) -> Result<()>;

    /// Failed: redeliver
    async fn nak(&self) -> Result<()>;
}

/// Terminal disposition of a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nak,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Nak => "nak",
        }
    }
}

/// Outstanding acknowledgment for a single message.
///
/// `ack` and `nak` consume the handle, so a message cannot be settled twice.
/// Dropping an unsettled handle is a leak and is logged as an error: the
/// broker only redelivers it after its ack deadline.
pub struct PendingAck {
    inner: Option<Box<dyn Acknowledger>>,
}

impl PendingAck {
    pub fn new(acknowledger: impl Acknowledger + 'static) -> Self {
        Self {
            inner: Some(Box::new(acknowledger)),
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.settle(Disposition::Ack).await
    }

    pub async fn nak(self) -> Result<()> {
        self.settle(Disposition::Nak).await
    }

    pub async fn settle(mut self, disposition: Disposition) -> Result<()> {
        match self.inner.take() {
            Some(acknowledger) => match disposition {
                Disposition::Ack => acknowledger.ack().await,
                Disposition::Nak => acknowledger.nak().await,
            },
            None => Ok(()),
        }
    }
}

impl fmt::Debug for PendingAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingAck")
            .field("settled", &self.inner.is_none())
            .finish()
    }
}

impl Drop for PendingAck {
    fn drop(&mut self) {
        if self.inner.is_some() {
            error!("message handle dropped without ack or nak");
        }
    }
}

/// A message as delivered by the transport, before validation.
#[derive(Debug)]
pub struct IncomingMessage {
    /// The subject the message was published to
    pub subject: String,
    /// Raw payload bytes
    pub payload: Bytes,
    /// Optional headers (used for trace context propagation)
    pub headers: Option<HeaderMap>,
    /// Delivery attempt reported by the broker, starting at 1
    pub delivery_attempt: u64,
    /// Handle used to settle the message exactly once
    pub handle: PendingAck,
}

impl IncomingMessage {
    pub fn new(subject: String, payload: Bytes, handle: PendingAck) -> Self {
        Self {
            subject,
            payload,
            headers: None,
            delivery_attempt: 1,
            handle,
        }
    }

    pub fn with_headers(mut self, headers: Option<HeaderMap>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_delivery_attempt(mut self, delivery_attempt: u64) -> Self {
        self.delivery_attempt = delivery_attempt;
        self
    }
}
