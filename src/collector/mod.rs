//! Result collector.
//!
//! Settlement outcomes from every channel's outcome feed funnel into one
//! bounded buffer. The collector loop reconciles each outcome into the
//! store with a conditional write and, once a transfer is terminal,
//! broadcasts a [`SettlementNotice`] so the executor worker holding the
//! transfer's slot can release it. An outcome that fails on a transient
//! store error goes back into the buffer after a short delay.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::model::{SettlementNotice, SettlementOutcome, TransferStatus};
use crate::storage::{StorageError, TransferStore};

mod feed;

pub use feed::spawn_outcome_feed;

/// Conditional-write conflicts tolerated per outcome before giving up.
const MAX_CONFLICT_RETRIES: u32 = 5;

/// Delay before an outcome that hit a transient error is reconciled again.
const REQUEUE_DELAY: Duration = Duration::from_millis(500);

/// What reconciling one outcome did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// The transfer moved to this terminal status.
    Applied(TransferStatus),
    /// The transfer was already terminal.
    Duplicate,
    /// No such transfer, or it was evicted.
    Unknown,
    /// The transfer was never submitted.
    NotSubmitted,
}

/// Reconciles settlement outcomes into transfer records.
pub struct ResultCollector {
    store: Arc<dyn TransferStore>,
    notices: broadcast::Sender<SettlementNotice>,
    retention: Duration,
}

impl ResultCollector {
    pub fn new(
        store: Arc<dyn TransferStore>,
        notices: broadcast::Sender<SettlementNotice>,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            notices,
            retention,
        }
    }

    /// Start the collector loop behind a buffer of `capacity` outcomes.
    ///
    /// Returns the sink outcome feeds write into. The loop ends when the
    /// token is cancelled or every sink is dropped.
    pub fn spawn(
        self: Arc<Self>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (mpsc::Sender<SettlementOutcome>, JoinHandle<()>) {
        let (sink, mut outcomes) = mpsc::channel::<SettlementOutcome>(capacity);
        let requeue = sink.downgrade();

        let handle = tokio::spawn(async move {
            info!(capacity, "Result collector started");
            loop {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = outcomes.recv() => match next {
                        Some(outcome) => outcome,
                        None => break,
                    },
                };

                match self.reconcile(outcome.clone()).await {
                    Ok(_) => {}
                    Err(e) if e.is_transient() => {
                        warn!(
                            transfer_id = %outcome.transfer_id,
                            error = %e,
                            "Failed to reconcile outcome, requeueing"
                        );
                        requeue_later(&requeue, outcome, cancel.clone());
                    }
                    Err(e) => {
                        error!(
                            transfer_id = %outcome.transfer_id,
                            error = %e,
                            "Failed to reconcile outcome"
                        );
                    }
                }
            }
            info!("Result collector stopped");
        });

        (sink, handle)
    }

    /// Apply one outcome to its transfer record.
    pub async fn reconcile(&self, outcome: SettlementOutcome) -> Result<Reconciled, StorageError> {
        let next = if outcome.success {
            TransferStatus::Completed
        } else {
            TransferStatus::Failed
        };

        let mut conflicts = 0;
        loop {
            let Some(mut record) = self.store.get(&outcome.transfer_id).await? else {
                warn!(
                    transfer_id = %outcome.transfer_id,
                    channel = %outcome.channel,
                    "Outcome for unknown transfer, dropping"
                );
                return Ok(Reconciled::Unknown);
            };

            if record.status.is_terminal() {
                debug!(
                    transfer_id = %outcome.transfer_id,
                    status = %record.status,
                    "Duplicate outcome for settled transfer, dropping"
                );
                return Ok(Reconciled::Duplicate);
            }
            if record.status == TransferStatus::Created {
                warn!(
                    transfer_id = %outcome.transfer_id,
                    channel = %outcome.channel,
                    "Outcome for transfer that was never submitted, dropping"
                );
                return Ok(Reconciled::NotSubmitted);
            }

            let expected = record.advance(next, Utc::now(), self.retention)?;
            if let Some(message) = &outcome.message {
                record.message = Some(message.clone());
            }
            if outcome.tx_id.is_some() {
                record.batcher_tx_id = outcome.tx_id.clone();
            }
            record.awaiting_reply = false;

            match self.store.update(expected, &record).await {
                Ok(()) => {
                    info!(
                        transfer_id = %record.transfer_id,
                        channel = %record.destination_channel,
                        status = %next,
                        "Transfer settled"
                    );
                    // No receivers just means no worker is waiting.
                    let _ = self.notices.send(SettlementNotice {
                        transfer_id: record.transfer_id,
                        channel: record.destination_channel,
                        status: next,
                    });
                    return Ok(Reconciled::Applied(next));
                }
                Err(StorageError::Conflict { actual, .. }) if conflicts < MAX_CONFLICT_RETRIES => {
                    conflicts += 1;
                    debug!(
                        transfer_id = %record.transfer_id,
                        actual = %actual,
                        conflicts,
                        "Conflicting write while reconciling, re-reading"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Put `outcome` back into the collector buffer after `REQUEUE_DELAY`.
///
/// Holds only a weak sender so a pending requeue does not keep the loop
/// alive once every feed is gone.
fn requeue_later(
    sink: &mpsc::WeakSender<SettlementOutcome>,
    outcome: SettlementOutcome,
    cancel: CancellationToken,
) {
    let sink = sink.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(REQUEUE_DELAY) => {}
        }
        if let Some(sink) = sink.upgrade() {
            if sink.send(outcome).await.is_err() {
                debug!("Collector stopped before requeued outcome was delivered");
            }
        }
    });
}

#[cfg(test)]
mod tests;
