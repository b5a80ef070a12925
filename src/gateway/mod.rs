//! Intake gateway.
//!
//! Admits signed transfer requests. Checks run cheapest first and nothing is
//! written until every check passed:
//!
//! 1. structure (fields, channel names, amount)
//! 2. signature, admin authority, customer address ownership
//! 3. deduplication by request id, then by transfer id
//! 4. nonce freshness and replay
//! 5. create the record, enqueue it on the destination channel
//!
//! Deduplication precedes the nonce claim so a client retrying the exact
//! same signed request gets the existing status instead of a replay error.
//! A nonce already claimed by the same request id is not a replay either:
//! the request is admitted again and record creation settles who wins.
//!
//! Channel names are case-insensitive and stored lowercased.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::executor::{ExecutorError, ExecutorRegistry};
use crate::model::{Originator, TransferRecord, TransferStatus};
use crate::storage::{StorageError, TransferStore};

pub mod nonce;
pub mod signature;
pub mod validation;

pub use nonce::{NonceError, NonceGuard};
pub use signature::{Ed25519Verifier, SignatureError, SignatureVerifier};
pub use validation::{TransferRequest, ValidationError};

/// Reasons a request is not admitted.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Nonce(#[from] NonceError),

    #[error("Permission denied: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl From<GatewayError> for Status {
    fn from(err: GatewayError) -> Self {
        match &err {
            GatewayError::Validation(_) | GatewayError::Nonce(_) => {
                Status::invalid_argument(err.to_string())
            }
            GatewayError::Signature(_) => Status::unauthenticated(err.to_string()),
            GatewayError::Forbidden(_) => Status::permission_denied(err.to_string()),
            GatewayError::Storage(_) => Status::unavailable(err.to_string()),
            GatewayError::Executor(ExecutorError::UnknownChannel(_)) => {
                Status::invalid_argument(err.to_string())
            }
            GatewayError::Executor(_) => Status::unavailable(err.to_string()),
        }
    }
}

/// Validates, deduplicates and admits transfer requests.
pub struct IntakeGateway {
    store: Arc<dyn TransferStore>,
    executors: Arc<ExecutorRegistry>,
    verifier: Arc<dyn SignatureVerifier>,
    nonces: NonceGuard,
    admins: HashSet<String>,
}

impl IntakeGateway {
    pub fn new(
        store: Arc<dyn TransferStore>,
        executors: Arc<ExecutorRegistry>,
        verifier: Arc<dyn SignatureVerifier>,
        admin_public_keys: impl IntoIterator<Item = String>,
        nonce_window: Duration,
    ) -> Self {
        Self {
            nonces: NonceGuard::new(store.clone(), nonce_window),
            store,
            executors,
            verifier,
            admins: admin_public_keys.into_iter().collect(),
        }
    }

    /// Admit `request`, returning the record now tracking it.
    ///
    /// A duplicate returns the existing record untouched.
    pub async fn submit(&self, mut request: TransferRequest) -> Result<TransferRecord, GatewayError> {
        validation::validate_request(&request, |channel| self.executors.contains(channel))?;
        self.authenticate(&mut request)?;

        if let Some(existing) = self.find_existing(&request).await? {
            return self.readmit(existing).await;
        }

        let claim = self
            .nonces
            .claim(&request.public_key, &request.nonce, &request.request_id)
            .await?;
        match claim {
            Ok(()) => {}
            Err(NonceError::Replayed {
                holder: Some(holder),
                ..
            }) if holder == request.request_id => {
                debug!(
                    request_id = %request.request_id,
                    "Nonce held by the same request, admitting again"
                );
            }
            Err(e) => return Err(e.into()),
        }

        let record = new_record(request);
        if !self.store.create(&record).await? {
            // Lost a race against a concurrent request for the same transfer.
            return match self.store.get(&record.transfer_id).await? {
                Some(existing) => Ok(existing),
                None => Err(StorageError::NotFound(record.transfer_id).into()),
            };
        }

        info!(
            transfer_id = %record.transfer_id,
            request_id = %record.request_id,
            from = %record.source_channel,
            to = %record.destination_channel,
            "Transfer admitted"
        );

        self.executors
            .enqueue(&record.destination_channel, record.transfer_id.clone())
            .await?;
        Ok(record)
    }

    /// Answer a duplicate with `existing`.
    ///
    /// A record still `Created` may have missed its enqueue, so it is queued
    /// again. The executor runs a transfer once however often it is queued.
    async fn readmit(&self, existing: TransferRecord) -> Result<TransferRecord, GatewayError> {
        if existing.status == TransferStatus::Created {
            debug!(transfer_id = %existing.transfer_id, "Re-enqueueing unstarted transfer");
            self.executors
                .enqueue(&existing.destination_channel, existing.transfer_id.clone())
                .await?;
        }
        Ok(existing)
    }

    /// Verify the signature and the signer's right to move `request.address`.
    ///
    /// Fills in the address of customer requests that left it empty.
    fn authenticate(&self, request: &mut TransferRequest) -> Result<(), GatewayError> {
        match request.originator {
            Originator::Admin => {
                if !self.admins.contains(&request.public_key) {
                    warn!(public_key = %request.public_key, "Transfer by unknown admin");
                    return Err(GatewayError::Forbidden(
                        "public key is not an administrator".to_string(),
                    ));
                }
            }
            Originator::Customer => {
                let own = self.verifier.address_of(&request.public_key)?;
                if request.address.is_empty() {
                    request.address = own;
                } else if request.address != own {
                    return Err(GatewayError::Forbidden(
                        "customers may only transfer from their own address".to_string(),
                    ));
                }
            }
        }

        self.verifier.verify(
            &request.public_key,
            &signature::signed_message(request),
            &request.signature,
        )?;
        Ok(())
    }

    async fn find_existing(
        &self,
        request: &TransferRequest,
    ) -> Result<Option<TransferRecord>, GatewayError> {
        if let Some(transfer_id) = self.store.transfer_for_request(&request.request_id).await? {
            if let Some(record) = self.store.get(&transfer_id).await? {
                debug!(
                    request_id = %request.request_id,
                    transfer_id = %transfer_id,
                    "Duplicate request"
                );
                return Ok(Some(record));
            }
        }

        let existing = self.store.get(&request.transfer_id).await?;
        if existing.is_some() {
            debug!(transfer_id = %request.transfer_id, "Duplicate transfer id");
        }
        Ok(existing)
    }
}

fn new_record(request: TransferRequest) -> TransferRecord {
    TransferRecord {
        transfer_id: request.transfer_id,
        request_id: request.request_id,
        originator: request.originator,
        source_channel: request.source_channel.to_lowercase(),
        destination_channel: request.destination_channel.to_lowercase(),
        chaincode: request.chaincode,
        address: request.address,
        asset: request.asset,
        amount: request.amount,
        status: TransferStatus::Created,
        attempt_count: 0,
        created_at: Utc::now(),
        terminal_at: None,
        expires_at: None,
        message: None,
        batcher_tx_id: None,
        awaiting_reply: false,
    }
}
