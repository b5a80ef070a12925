//! Batcher client abstraction.
//!
//! Each destination channel is served by one batcher: a remote service that
//! accepts transfer transactions, executes them on the ledger and later
//! reports a settlement outcome. The pipeline talks to it only through
//! [`BatcherClient`], so the executor and collector never see transport
//! details.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tonic::Status;

use crate::model::{SettlementOutcome, TransferRecord};
use crate::utils::retry::is_transient_status;

pub mod grpc;

pub use grpc::GrpcBatcherClient;

/// Chaincode method the batcher runs to credit the destination channel.
pub const TRANSFER_METHOD: &str = "channelTransferFrom";

/// A transfer transaction handed to a batcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub request_id: String,
    pub transfer_id: String,
    pub channel: String,
    pub chaincode: String,
    pub method: String,
    pub args: Vec<String>,
}

impl Submission {
    pub fn from_record(record: &TransferRecord) -> Self {
        Self {
            request_id: record.request_id.clone(),
            transfer_id: record.transfer_id.clone(),
            channel: record.destination_channel.clone(),
            chaincode: record.chaincode.clone(),
            method: TRANSFER_METHOD.to_string(),
            args: record.batcher_args(),
        }
    }
}

/// The batcher took the transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acceptance {
    /// Transaction id assigned by the batcher, when it reports one.
    pub tx_id: Option<String>,
}

/// Errors from a batcher call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatcherError {
    /// Transport or availability failure; the same call may succeed later.
    #[error("Batcher unavailable: {0}")]
    Transient(String),

    /// The batcher refused the transaction; retrying will not help.
    #[error("Batcher rejected transfer: {0}")]
    Rejected(String),

    /// No answer within the per-attempt deadline.
    #[error("Batcher call timed out")]
    Timeout,

    /// Invalid batcher endpoint configuration.
    #[error("Invalid batcher endpoint: {0}")]
    Endpoint(String),
}

impl BatcherError {
    /// Whether the call may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, BatcherError::Transient(_) | BatcherError::Timeout)
    }
}

impl From<Status> for BatcherError {
    fn from(status: Status) -> Self {
        let message = format!("{:?}: {}", status.code(), status.message());
        if is_transient_status(&status) {
            BatcherError::Transient(message)
        } else {
            BatcherError::Rejected(message)
        }
    }
}

/// Stream of settlement outcomes from one batcher.
pub type OutcomeStream =
    Pin<Box<dyn Stream<Item = Result<SettlementOutcome, BatcherError>> + Send + 'static>>;

/// Interface to the batcher of one destination channel.
#[async_trait]
pub trait BatcherClient: Send + Sync {
    /// Destination channel this batcher serves.
    fn channel(&self) -> &str;

    /// Hand a transaction to the batcher.
    async fn submit(&self, submission: &Submission) -> Result<Acceptance, BatcherError>;

    /// Subscribe to settlement outcomes for this channel.
    async fn subscribe_outcomes(&self) -> Result<OutcomeStream, BatcherError>;
}

#[cfg(test)]
mod tests {
    use tonic::Code;

    use super::*;

    #[test]
    fn test_status_classification() {
        let unavailable: BatcherError = Status::unavailable("connection refused").into();
        assert!(unavailable.is_transient());

        let deadline: BatcherError = Status::deadline_exceeded("slow").into();
        assert!(deadline.is_transient());

        let invalid: BatcherError = Status::invalid_argument("bad amount").into();
        assert!(!invalid.is_transient());
        assert!(matches!(invalid, BatcherError::Rejected(msg) if msg.contains("bad amount")));

        let precondition: BatcherError = Status::new(Code::FailedPrecondition, "balance").into();
        assert!(!precondition.is_transient());
    }

    #[test]
    fn test_timeout_is_transient() {
        assert!(BatcherError::Timeout.is_transient());
        assert!(!BatcherError::Endpoint("bad uri".to_string()).is_transient());
    }
}
