use crate::domain::BatchMessage;
use common::nats::Disposition;
use tracing::{debug, error};

/// Outcome of settling one batch of messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementReport {
    pub disposition: Disposition,
    /// Terminal calls the broker accepted
    pub settled: usize,
    /// Terminal calls that failed in transport
    pub failed: usize,
}

/// Apply the same disposition to every message of a batch.
///
/// Each handle is consumed, so every message gets exactly one terminal call.
/// Transport errors are logged and counted, never retried: the broker
/// redelivers anything it did not see settled.
pub async fn settle_batch(
    messages: Vec<BatchMessage>,
    disposition: Disposition,
) -> SettlementReport {
    let mut report = SettlementReport {
        disposition,
        settled: 0,
        failed: 0,
    };

    for message in messages {
        match message.handle.settle(disposition).await {
            Ok(()) => report.settled += 1,
            Err(e) => {
                report.failed += 1;
                error!(
                    subject = %message.subject,
                    delivery_attempt = message.delivery_attempt,
                    disposition = disposition.as_str(),
                    error = %e,
                    "failed to settle message"
                );
            }
        }
    }

    debug!(
        disposition = disposition.as_str(),
        settled = report.settled,
        failed = report.failed,
        "batch settled"
    );

    report
}
