//! Transfer status queries.

use std::sync::Arc;

use tonic::Status;
use tracing::{debug, error};

use crate::model::{TransferRecord, TransferStatus};
use crate::proto::channel_transfer::transfer_status_response::Status as WireStatus;
use crate::proto::channel_transfer::TransferStatusResponse;
use crate::storage::TransferStore;

/// Answers `TransferStatus` from the store.
pub struct StatusHandler {
    store: Arc<dyn TransferStore>,
}

impl StatusHandler {
    pub fn new(store: Arc<dyn TransferStore>) -> Self {
        Self { store }
    }

    /// Current status of `transfer_id`; `NOT_FOUND` once evicted.
    pub async fn status(&self, transfer_id: &str) -> Result<TransferStatusResponse, Status> {
        if transfer_id.is_empty() {
            return Err(Status::invalid_argument("id_transfer is required"));
        }

        let record = self.store.get(transfer_id).await.map_err(|e| {
            error!(transfer_id = %transfer_id, error = %e, "Status lookup failed");
            Status::unavailable(e.to_string())
        })?;

        match record {
            Some(record) if record.status != TransferStatus::Expired => {
                debug!(transfer_id = %transfer_id, status = %record.status, "Status lookup");
                Ok(to_response(&record))
            }
            _ => Err(Status::not_found(format!(
                "transfer '{}' not found",
                transfer_id
            ))),
        }
    }
}

/// Wire status for a lifecycle status.
pub fn wire_status(status: TransferStatus) -> WireStatus {
    match status {
        TransferStatus::Created | TransferStatus::Submitted | TransferStatus::InProcess => {
            WireStatus::InProcess
        }
        TransferStatus::Completed => WireStatus::Completed,
        TransferStatus::Failed => WireStatus::Error,
        TransferStatus::Expired => WireStatus::Undefined,
    }
}

/// Response describing `record`. The diagnostic is only exposed once terminal.
pub fn to_response(record: &TransferRecord) -> TransferStatusResponse {
    let message = if record.status.is_terminal() {
        record.message.clone().unwrap_or_default()
    } else {
        String::new()
    };
    TransferStatusResponse {
        id_transfer: record.transfer_id.clone(),
        status: wire_status(record.status) as i32,
        message,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use std::time::Duration;

    use super::*;
    use crate::storage::{KeySpace, MemoryTransferStore};
    use crate::test_utils::sample_record;

    #[test]
    fn test_wire_status_mapping() {
        assert_eq!(wire_status(TransferStatus::Created), WireStatus::InProcess);
        assert_eq!(wire_status(TransferStatus::Submitted), WireStatus::InProcess);
        assert_eq!(wire_status(TransferStatus::InProcess), WireStatus::InProcess);
        assert_eq!(wire_status(TransferStatus::Completed), WireStatus::Completed);
        assert_eq!(wire_status(TransferStatus::Failed), WireStatus::Error);
    }

    #[test]
    fn test_message_hidden_until_terminal() {
        let mut record = sample_record("t1", "fiat", "cc");
        record.message = Some("Batcher unavailable: retrying".to_string());
        assert_eq!(to_response(&record).message, "");

        record
            .advance(TransferStatus::Failed, Utc::now(), Duration::from_secs(60))
            .unwrap();
        let response = to_response(&record);
        assert_eq!(response.status, WireStatus::Error as i32);
        assert_eq!(response.message, "Batcher unavailable: retrying");
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_not_found_after_eviction() {
        let store = Arc::new(MemoryTransferStore::new(KeySpace::default()));
        let handler = StatusHandler::new(store.clone());

        let mut record = sample_record("t1", "fiat", "cc");
        store.create(&record).await.unwrap();
        let response = handler.status("t1").await.unwrap();
        assert_eq!(response.status, WireStatus::InProcess as i32);

        let previous = record
            .advance(TransferStatus::Submitted, Utc::now(), Duration::from_secs(60))
            .unwrap();
        store.update(previous, &record).await.unwrap();
        let previous = record
            .advance(TransferStatus::Completed, Utc::now(), Duration::from_secs(60))
            .unwrap();
        store.update(previous, &record).await.unwrap();
        assert_eq!(
            handler.status("t1").await.unwrap().status,
            WireStatus::Completed as i32
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        let err = handler.status("t1").await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_empty_id_is_invalid() {
        let handler = StatusHandler::new(Arc::new(MemoryTransferStore::default()));
        let err = handler.status("").await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }
}
