use crate::domain::QueuedReading;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use common::domain::ValidatedReading;
use common::nats::{Acknowledger, Disposition, IncomingMessage, PendingAck};
use std::sync::{Arc, Mutex};

/// Records every terminal call made on handles it creates
#[derive(Clone, Default)]
pub(crate) struct AckLog {
    events: Arc<Mutex<Vec<(String, Disposition)>>>,
    fail_transport: bool,
}

impl AckLog {
    /// A log whose handles record the call but report a broker error
    pub fn failing() -> Self {
        Self {
            fail_transport: true,
            ..Default::default()
        }
    }

    pub fn handle(&self, id: &str) -> PendingAck {
        PendingAck::new(LoggedAck {
            id: id.to_string(),
            log: self.clone(),
        })
    }

    pub fn events(&self) -> Vec<(String, Disposition)> {
        self.events.lock().unwrap().clone()
    }

    pub fn acks(&self) -> usize {
        self.count(Disposition::Ack)
    }

    pub fn naks(&self) -> usize {
        self.count(Disposition::Nak)
    }

    pub fn dispositions_for(&self, id: &str) -> Vec<Disposition> {
        self.events()
            .into_iter()
            .filter(|(event_id, _)| event_id == id)
            .map(|(_, disposition)| disposition)
            .collect()
    }

    fn count(&self, disposition: Disposition) -> usize {
        self.events()
            .iter()
            .filter(|(_, d)| *d == disposition)
            .count()
    }

    fn record(&self, id: &str, disposition: Disposition) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push((id.to_string(), disposition));
        if self.fail_transport {
            Err(anyhow!("broker unavailable"))
        } else {
            Ok(())
        }
    }
}

struct LoggedAck {
    id: String,
    log: AckLog,
}

#[async_trait]
impl Acknowledger for LoggedAck {
    async fn ack(&self) -> Result<()> {
        self.log.record(&self.id, Disposition::Ack)
    }

    async fn nak(&self) -> Result<()> {
        self.log.record(&self.id, Disposition::Nak)
    }
}

pub(crate) fn reading(device_id: &str) -> ValidatedReading {
    let occurred = Utc.with_ymd_and_hms(2023, 10, 1, 10, 0, 0).unwrap();
    ValidatedReading::new(device_id.to_string(), occurred, 20.5, 50.0, Utc::now()).unwrap()
}

/// A queued reading whose handle is logged under `device_id`
pub(crate) fn queued(log: &AckLog, device_id: &str) -> QueuedReading {
    QueuedReading {
        subject: format!("readings.{device_id}"),
        delivery_attempt: 1,
        handle: log.handle(device_id),
        reading: reading(device_id),
    }
}

pub(crate) fn valid_payload(device_id: &str) -> String {
    format!(
        r#"{{"device_id":"{device_id}","timestamp_utc":"2023-10-01T10:00:00Z","temperature_celsius":20.5,"humidity_percent":50.0}}"#
    )
}

/// An incoming message whose handle is logged under `id`
pub(crate) fn incoming(log: &AckLog, id: &str, payload: &str) -> IncomingMessage {
    IncomingMessage::new(
        format!("readings.{id}"),
        Bytes::from(payload.to_string()),
        log.handle(id),
    )
}
