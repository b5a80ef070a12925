//! Executor worker: drives one transfer from `Created` to settlement.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ExecutorSettings;
use crate::batcher::{Acceptance, BatcherClient, BatcherError, Submission};
use crate::model::{SettlementNotice, SubmissionPreimage, TransferRecord, TransferStatus};
use crate::storage::{StorageError, TransferStore};

/// Result of a conditional write.
enum Step {
    /// The write landed; carries the stored record.
    Written(TransferRecord),
    /// Another writer moved the record first; carries its current state.
    Superseded(TransferRecord),
}

#[derive(Clone)]
pub(super) struct Worker {
    batcher: Arc<dyn BatcherClient>,
    store: Arc<dyn TransferStore>,
    notices: broadcast::Sender<SettlementNotice>,
    settings: ExecutorSettings,
    cancel: CancellationToken,
}

impl Worker {
    pub(super) fn new(
        batcher: Arc<dyn BatcherClient>,
        store: Arc<dyn TransferStore>,
        notices: broadcast::Sender<SettlementNotice>,
        settings: ExecutorSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            batcher,
            store,
            notices,
            settings,
            cancel,
        }
    }

    /// Drive `transfer_id` until it is terminal or the process shuts down.
    pub(super) async fn run(&self, transfer_id: &str) {
        // Subscribe before submitting so a fast outcome cannot be missed.
        let notices = self.notices.subscribe();

        if let Err(e) = self.drive(transfer_id, notices).await {
            // The record stays unfinished and is picked up again on restart.
            error!(
                transfer_id = %transfer_id,
                channel = %self.batcher.channel(),
                error = %e,
                "Executor worker aborted"
            );
        }
    }

    async fn drive(
        &self,
        transfer_id: &str,
        notices: broadcast::Receiver<SettlementNotice>,
    ) -> Result<(), StorageError> {
        let Some(record) = self.store.get(transfer_id).await? else {
            warn!(transfer_id = %transfer_id, "Dequeued transfer not in store");
            return Ok(());
        };

        let record = match record.status {
            status if status.is_terminal() => return Ok(()),
            TransferStatus::Created => self.begin(record).await?,
            TransferStatus::Submitted => self.resume(record).await?,
            _ => Some(record),
        };

        if record.is_some_and(|r| r.status.is_in_flight()) {
            self.await_settlement(transfer_id, notices).await?;
        }
        Ok(())
    }

    /// Take ownership of a `Created` record and submit it.
    ///
    /// The `Created -> Submitted` write decides ownership: only the worker
    /// whose write lands submits. The preimage follows that write and
    /// precedes the first batcher call. A preimage found on a `Created`
    /// record was left by another submitter, so the transfer is handed to
    /// reconciliation instead.
    ///
    /// Returns the record to await, or `None` when there is nothing to await.
    async fn begin(&self, record: TransferRecord) -> Result<Option<TransferRecord>, StorageError> {
        if self.store.get_preimage(&record.transfer_id).await?.is_some() {
            info!(
                transfer_id = %record.transfer_id,
                "Submission preimage exists, awaiting reconciliation instead of resubmitting"
            );
            let mut draft = record;
            draft.awaiting_reply = true;
            return match self.write(draft, TransferStatus::Submitted).await? {
                Step::Written(record) => Ok(Some(record)),
                Step::Superseded(current) => Ok(self.still_open(current)),
            };
        }

        let record = match self.write(record, TransferStatus::Submitted).await? {
            Step::Written(record) => record,
            Step::Superseded(current) => return Ok(self.still_open(current)),
        };

        self.store
            .put_preimage(&SubmissionPreimage {
                transfer_id: record.transfer_id.clone(),
                channel: record.destination_channel.clone(),
                created_at: Utc::now(),
            })
            .await?;

        self.submit_with_retry(record, 1).await
    }

    /// Pick up a `Submitted` record left by an earlier run.
    ///
    /// A record whose last attempt has no recorded reply is left to
    /// reconciliation. Otherwise the remaining retry budget is spent, or the
    /// transfer fails when none is left.
    async fn resume(&self, record: TransferRecord) -> Result<Option<TransferRecord>, StorageError> {
        if record.awaiting_reply {
            info!(
                transfer_id = %record.transfer_id,
                attempt = record.attempt_count,
                "Reply to last submission attempt unknown, awaiting reconciliation"
            );
            return Ok(Some(record));
        }

        if !self.settings.retry.should_retry(record.attempt_count) {
            warn!(
                transfer_id = %record.transfer_id,
                attempts = record.attempt_count,
                "Retry budget already spent, failing transfer"
            );
            return match self.write(record, TransferStatus::Failed).await? {
                Step::Written(record) | Step::Superseded(record) => Ok(self.still_open(record)),
            };
        }

        let next = record.attempt_count + 1;
        info!(transfer_id = %record.transfer_id, attempt = next, "Resuming submission");
        self.submit_with_retry(record, next).await
    }

    /// Submit with capped exponential backoff, starting at `first_attempt`.
    ///
    /// Each attempt is claimed with a conditional `Submitted -> Submitted`
    /// write before the batcher call, so an outcome settling the transfer
    /// during backoff stops the retries.
    async fn submit_with_retry(
        &self,
        mut record: TransferRecord,
        first_attempt: u32,
    ) -> Result<Option<TransferRecord>, StorageError> {
        let retry = &self.settings.retry;
        let mut attempt = first_attempt;

        loop {
            let delay = retry.delay_before_attempt(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let mut claim = record.clone();
            claim.attempt_count = attempt;
            claim.awaiting_reply = true;
            record = match self.write(claim, TransferStatus::Submitted).await? {
                Step::Written(record) => record,
                Step::Superseded(current) => {
                    debug!(
                        transfer_id = %current.transfer_id,
                        status = %current.status,
                        "Transfer moved on before attempt, not submitting"
                    );
                    return Ok(self.still_open(current));
                }
            };

            let submission = Submission::from_record(&record);
            debug!(
                transfer_id = %record.transfer_id,
                channel = %submission.channel,
                attempt,
                "Submitting to batcher"
            );

            let mut draft = record.clone();
            draft.awaiting_reply = false;

            let (next, step) = match self.attempt(&submission).await {
                Ok(Acceptance { tx_id }) => {
                    info!(
                        transfer_id = %record.transfer_id,
                        attempt,
                        tx_id = tx_id.as_deref().unwrap_or(""),
                        "Batcher accepted transfer"
                    );
                    draft.batcher_tx_id = tx_id;
                    draft.message = None;
                    let step = self.write(draft, TransferStatus::InProcess).await?;
                    (TransferStatus::InProcess, step)
                }
                Err(e) if e.is_transient() && retry.should_retry(attempt) => {
                    warn!(
                        transfer_id = %record.transfer_id,
                        attempt,
                        error = %e,
                        "Batcher submission failed, retrying"
                    );
                    draft.message = Some(e.to_string());
                    let step = self.write(draft, TransferStatus::Submitted).await?;
                    (TransferStatus::Submitted, step)
                }
                Err(e) => {
                    warn!(
                        transfer_id = %record.transfer_id,
                        attempt,
                        error = %e,
                        "Batcher submission failed permanently"
                    );
                    draft.message = Some(e.to_string());
                    let step = self.write(draft, TransferStatus::Failed).await?;
                    (TransferStatus::Failed, step)
                }
            };

            match step {
                Step::Written(written) if next == TransferStatus::Submitted => record = written,
                Step::Written(written) => return Ok(self.still_open(written)),
                Step::Superseded(current) => return Ok(self.still_open(current)),
            }
            attempt += 1;
        }
    }

    /// One batcher call, bounded by the per-attempt deadline.
    async fn attempt(&self, submission: &Submission) -> Result<Acceptance, BatcherError> {
        match self.settings.attempt_timeout {
            Some(deadline) => tokio::time::timeout(deadline, self.batcher.submit(submission))
                .await
                .unwrap_or(Err(BatcherError::Timeout)),
            None => self.batcher.submit(submission).await,
        }
    }

    /// Advance `draft` to `next` with a write conditional on its current status.
    async fn write(
        &self,
        mut draft: TransferRecord,
        next: TransferStatus,
    ) -> Result<Step, StorageError> {
        let expected = draft.advance(next, Utc::now(), self.settings.retention)?;
        match self.store.update(expected, &draft).await {
            Ok(()) => Ok(Step::Written(draft)),
            Err(StorageError::Conflict { actual, .. }) => {
                debug!(
                    transfer_id = %draft.transfer_id,
                    expected = %expected,
                    actual = %actual,
                    "Lost conditional write, re-reading"
                );
                match self.store.get(&draft.transfer_id).await? {
                    Some(current) => Ok(Step::Superseded(current)),
                    None => Err(StorageError::NotFound(draft.transfer_id)),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn still_open(&self, record: TransferRecord) -> Option<TransferRecord> {
        (!record.status.is_terminal()).then_some(record)
    }

    /// Wait until the collector settles `transfer_id`.
    ///
    /// Wakes on settlement notices and re-reads the store on an interval and
    /// whenever notices were dropped.
    async fn await_settlement(
        &self,
        transfer_id: &str,
        mut notices: broadcast::Receiver<SettlementNotice>,
    ) -> Result<(), StorageError> {
        let mut poll = tokio::time::interval(self.settings.settle_poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut notices_open = true;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                notice = notices.recv(), if notices_open => match notice {
                    Ok(notice) if notice.transfer_id == transfer_id => {
                        debug!(transfer_id = %transfer_id, status = %notice.status, "Transfer settled");
                        return Ok(());
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(transfer_id = %transfer_id, skipped, "Settlement notices lagged");
                        if self.is_settled(transfer_id).await? {
                            return Ok(());
                        }
                    }
                    Err(RecvError::Closed) => notices_open = false,
                },
                _ = poll.tick() => {
                    if self.is_settled(transfer_id).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Terminal or already evicted.
    async fn is_settled(&self, transfer_id: &str) -> Result<bool, StorageError> {
        Ok(self
            .store
            .get(transfer_id)
            .await?
            .map_or(true, |record| record.status.is_terminal()))
    }
}
