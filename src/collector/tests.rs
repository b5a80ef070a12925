use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::batcher::BatcherError;
use crate::model::{SubmissionPreimage, TransferRecord};
use crate::storage::{KeySpace, MemoryTransferStore, NonceClaim};
use crate::test_utils::{eventually, sample_record, MockBatcher};

const RETENTION: Duration = Duration::from_secs(3600);

fn outcome(transfer_id: &str, success: bool) -> SettlementOutcome {
    SettlementOutcome {
        transfer_id: transfer_id.to_string(),
        channel: "cc".to_string(),
        success,
        message: (!success).then(|| "chaincode error".to_string()),
        tx_id: Some("tx-1".to_string()),
    }
}

async fn store_with(status: TransferStatus) -> Arc<MemoryTransferStore> {
    let store = Arc::new(MemoryTransferStore::new(KeySpace::default()));
    let mut record = sample_record("t1", "fiat", "cc");
    store.create(&record).await.unwrap();
    let path: &[TransferStatus] = match status {
        TransferStatus::Created => &[],
        TransferStatus::Submitted => &[TransferStatus::Submitted],
        TransferStatus::InProcess => &[TransferStatus::Submitted, TransferStatus::InProcess],
        TransferStatus::Completed => &[TransferStatus::Submitted, TransferStatus::Completed],
        other => panic!("no fixture path to {}", other),
    };
    for next in path {
        let previous = record.advance(*next, Utc::now(), RETENTION).unwrap();
        store.update(previous, &record).await.unwrap();
    }
    store
}

#[tokio::test]
async fn test_success_completes_in_process_transfer() {
    let store = store_with(TransferStatus::InProcess).await;
    let (notices, mut rx) = broadcast::channel(8);
    let collector = ResultCollector::new(store.clone(), notices, RETENTION);

    let result = collector.reconcile(outcome("t1", true)).await.unwrap();
    assert_eq!(result, Reconciled::Applied(TransferStatus::Completed));

    let record = store.get("t1").await.unwrap().unwrap();
    assert_eq!(record.status, TransferStatus::Completed);
    assert!(record.terminal_at.is_some());
    let expires = record.expires_at.unwrap();
    assert_eq!(
        expires - record.terminal_at.unwrap(),
        chrono::Duration::seconds(3600)
    );

    let notice = rx.recv().await.unwrap();
    assert_eq!(notice.transfer_id, "t1");
    assert_eq!(notice.status, TransferStatus::Completed);
}

#[tokio::test]
async fn test_failure_records_diagnostic() {
    let store = store_with(TransferStatus::Submitted).await;
    let (notices, _) = broadcast::channel(8);
    let collector = ResultCollector::new(store.clone(), notices, RETENTION);

    let result = collector.reconcile(outcome("t1", false)).await.unwrap();
    assert_eq!(result, Reconciled::Applied(TransferStatus::Failed));

    let record = store.get("t1").await.unwrap().unwrap();
    assert_eq!(record.status, TransferStatus::Failed);
    assert_eq!(record.message.as_deref(), Some("chaincode error"));
}

#[tokio::test]
async fn test_late_outcome_for_terminal_transfer_is_noop() {
    let store = store_with(TransferStatus::Completed).await;
    let before = store.get("t1").await.unwrap().unwrap();
    let (notices, mut rx) = broadcast::channel(8);
    let collector = ResultCollector::new(store.clone(), notices, RETENTION);

    let result = collector.reconcile(outcome("t1", false)).await.unwrap();
    assert_eq!(result, Reconciled::Duplicate);
    assert_eq!(store.get("t1").await.unwrap().unwrap(), before);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_unknown_and_unsubmitted_outcomes_are_dropped() {
    let store = store_with(TransferStatus::Created).await;
    let (notices, _) = broadcast::channel(8);
    let collector = ResultCollector::new(store.clone(), notices, RETENTION);

    assert_eq!(
        collector.reconcile(outcome("ghost", true)).await.unwrap(),
        Reconciled::Unknown
    );
    assert_eq!(
        collector.reconcile(outcome("t1", true)).await.unwrap(),
        Reconciled::NotSubmitted
    );
    assert_eq!(
        store.get("t1").await.unwrap().unwrap().status,
        TransferStatus::Created
    );
}

#[tokio::test]
async fn test_collector_loop_drains_sink() {
    let store = store_with(TransferStatus::InProcess).await;
    let (notices, _) = broadcast::channel(8);
    let collector = Arc::new(ResultCollector::new(store.clone(), notices, RETENTION));
    let cancel = CancellationToken::new();

    let (sink, handle) = collector.spawn(1, cancel.clone());
    sink.send(outcome("ghost", true)).await.unwrap();
    sink.send(outcome("t1", true)).await.unwrap();

    eventually(100, || async {
        store.get("t1").await.unwrap().unwrap().status == TransferStatus::Completed
    })
    .await;

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_outcome_feed_resubscribes_after_failures() {
    let store = store_with(TransferStatus::InProcess).await;
    let (notices, _) = broadcast::channel(8);
    let collector = Arc::new(ResultCollector::new(store.clone(), notices, RETENTION));
    let cancel = CancellationToken::new();
    let (sink, _collector) = collector.spawn(4, cancel.clone());

    let batcher = Arc::new(MockBatcher::new("cc"));
    batcher.fail_subscriptions(2);
    let feed = spawn_outcome_feed(batcher.clone(), sink, cancel.clone());

    eventually(1000, || async { batcher.subscription_count() == 1 }).await;

    batcher.break_streams(BatcherError::Transient("reset".to_string()));
    eventually(1000, || async { batcher.subscription_count() == 2 }).await;

    batcher.settle("t1", true, None);
    eventually(1000, || async {
        store.get("t1").await.unwrap().unwrap().status == TransferStatus::Completed
    })
    .await;

    cancel.cancel();
    feed.await.unwrap();
}

/// Memory store whose first `conflicts` updates lose to a phantom writer.
struct ContendedStore {
    inner: MemoryTransferStore,
    conflicts: AtomicU32,
}

#[async_trait]
impl TransferStore for ContendedStore {
    async fn create(&self, record: &TransferRecord) -> crate::storage::Result<bool> {
        self.inner.create(record).await
    }

    async fn get(&self, transfer_id: &str) -> crate::storage::Result<Option<TransferRecord>> {
        self.inner.get(transfer_id).await
    }

    async fn transfer_for_request(&self, request_id: &str) -> crate::storage::Result<Option<String>> {
        self.inner.transfer_for_request(request_id).await
    }

    async fn update(
        &self,
        expected: TransferStatus,
        record: &TransferRecord,
    ) -> crate::storage::Result<()> {
        let left = self.conflicts.load(Ordering::SeqCst);
        if left > 0 {
            self.conflicts.store(left - 1, Ordering::SeqCst);
            return Err(StorageError::Conflict {
                transfer_id: record.transfer_id.clone(),
                expected,
                actual: expected,
            });
        }
        self.inner.update(expected, record).await
    }

    async fn put_preimage(&self, preimage: &SubmissionPreimage) -> crate::storage::Result<bool> {
        self.inner.put_preimage(preimage).await
    }

    async fn get_preimage(
        &self,
        transfer_id: &str,
    ) -> crate::storage::Result<Option<SubmissionPreimage>> {
        self.inner.get_preimage(transfer_id).await
    }

    async fn claim_nonce(
        &self,
        signer: &str,
        nonce: u64,
        request_id: &str,
        ttl: Duration,
    ) -> crate::storage::Result<NonceClaim> {
        self.inner.claim_nonce(signer, nonce, request_id, ttl).await
    }

    async fn list_unfinished(&self) -> crate::storage::Result<Vec<TransferRecord>> {
        self.inner.list_unfinished().await
    }

    async fn evict_expired(&self) -> crate::storage::Result<usize> {
        self.inner.evict_expired().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_outcome_survives_sustained_write_contention() {
    let inner = MemoryTransferStore::new(KeySpace::default());
    let mut record = sample_record("t1", "fiat", "cc");
    inner.create(&record).await.unwrap();
    let previous = record
        .advance(TransferStatus::Submitted, Utc::now(), RETENTION)
        .unwrap();
    inner.update(previous, &record).await.unwrap();

    // More conflicts than one reconcile pass tolerates.
    let store = Arc::new(ContendedStore {
        inner,
        conflicts: AtomicU32::new(MAX_CONFLICT_RETRIES + 2),
    });
    let (notices, _) = broadcast::channel(8);
    let collector = Arc::new(ResultCollector::new(store.clone(), notices, RETENTION));
    let cancel = CancellationToken::new();
    let (sink, handle) = collector.spawn(4, cancel.clone());

    sink.send(outcome("t1", true)).await.unwrap();

    eventually(500, || async {
        store.get("t1").await.unwrap().unwrap().status == TransferStatus::Completed
    })
    .await;
    assert_eq!(store.conflicts.load(Ordering::SeqCst), 0);

    cancel.cancel();
    handle.await.unwrap();
}
