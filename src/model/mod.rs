//! Transfer records and the values exchanged between pipeline stages.

mod status;

pub use status::{TransferStatus, TransitionError};

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who signed the request that created a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Originator {
    /// Moves the signer's own funds.
    Customer,
    /// May move funds of any address.
    Admin,
}

impl Originator {
    /// Method name the request must be signed for.
    pub fn method_name(self) -> &'static str {
        match self {
            Originator::Customer => "channelTransferByCustomer",
            Originator::Admin => "channelTransferByAdmin",
        }
    }
}

/// Durable record tracking one transfer from intake to eviction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub transfer_id: String,
    pub request_id: String,
    pub originator: Originator,
    pub source_channel: String,
    pub destination_channel: String,
    pub chaincode: String,
    pub address: String,
    pub asset: String,
    pub amount: String,
    pub status: TransferStatus,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub terminal_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Diagnostic text: rejection reason, last batcher error or settlement detail.
    #[serde(default)]
    pub message: Option<String>,
    /// Transaction id assigned by the batcher on acceptance.
    #[serde(default)]
    pub batcher_tx_id: Option<String>,
    /// An attempt went out to the batcher and its reply is not recorded yet.
    ///
    /// Found set after a restart, the attempt may have reached the batcher,
    /// so the transfer is left to reconciliation instead of being resent.
    #[serde(default)]
    pub awaiting_reply: bool,
}

impl TransferRecord {
    /// Move to `next`, stamping terminal timestamps when `next` is terminal.
    ///
    /// Returns the previous status, which callers pass to the store as the
    /// expected value of the conditional write.
    pub fn advance(
        &mut self,
        next: TransferStatus,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<TransferStatus, TransitionError> {
        let previous = self.status;
        if !previous.can_transition_to(next) {
            return Err(TransitionError {
                from: previous,
                to: next,
            });
        }

        self.status = next;
        if next.is_terminal() && self.terminal_at.is_none() {
            self.terminal_at = Some(now);
            let retention = chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::MAX);
            self.expires_at = now.checked_add_signed(retention);
        }
        Ok(previous)
    }

    /// Time left until eviction, if the record is terminal.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Argument list forwarded to the batcher.
    pub fn batcher_args(&self) -> Vec<String> {
        vec![
            self.transfer_id.clone(),
            self.destination_channel.clone(),
            self.address.clone(),
            self.asset.clone(),
            self.amount.clone(),
        ]
    }
}

/// Marker proving a transfer was handed to its batcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionPreimage {
    pub transfer_id: String,
    pub channel: String,
    pub created_at: DateTime<Utc>,
}

/// Settlement result reported by a batcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementOutcome {
    pub transfer_id: String,
    pub channel: String,
    pub success: bool,
    pub message: Option<String>,
    pub tx_id: Option<String>,
}

/// Broadcast after a transfer reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementNotice {
    pub transfer_id: String,
    pub channel: String,
    pub status: TransferStatus,
}
