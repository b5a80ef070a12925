//! Transfer lifecycle state machine.
//!
//! ```text
//! Created -> Submitted -> InProcess -> Completed -> Expired
//!    |           |            |
//!    |           |            +-----> Failed ----> Expired
//!    |           +--> Completed | Failed
//!    +--> Failed
//! ```
//!
//! Every legal move goes strictly forward. `Submitted -> Completed|Failed`
//! exists because a settlement outcome may overtake the executor's acceptance
//! write; `Created -> Failed` covers requests the executor gives up on before
//! any submission. `Submitted -> Submitted` is the only self move and records
//! a failed attempt.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    Created,
    Submitted,
    InProcess,
    Completed,
    Failed,
    Expired,
}

impl TransferStatus {
    /// Position in the lifecycle. Terminal states share a rank.
    fn rank(self) -> u8 {
        match self {
            TransferStatus::Created => 0,
            TransferStatus::Submitted => 1,
            TransferStatus::InProcess => 2,
            TransferStatus::Completed | TransferStatus::Failed => 3,
            TransferStatus::Expired => 4,
        }
    }

    /// True for `Completed`, `Failed` and `Expired`.
    pub fn is_terminal(self) -> bool {
        self.rank() >= 3
    }

    /// True while a transfer occupies an executor slot.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TransferStatus::Submitted | TransferStatus::InProcess)
    }

    /// Whether `self -> next` is a legal move.
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Created, Submitted)
                | (Created, Failed)
                | (Submitted, Submitted)
                | (Submitted, InProcess)
                | (Submitted, Completed)
                | (Submitted, Failed)
                | (InProcess, Completed)
                | (InProcess, Failed)
                | (Completed, Expired)
                | (Failed, Expired)
        )
    }

    /// Stable name used in storage and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Created => "Created",
            TransferStatus::Submitted => "Submitted",
            TransferStatus::InProcess => "InProcess",
            TransferStatus::Completed => "Completed",
            TransferStatus::Failed => "Failed",
            TransferStatus::Expired => "Expired",
        }
    }
}

impl std::str::FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Created" => Ok(TransferStatus::Created),
            "Submitted" => Ok(TransferStatus::Submitted),
            "InProcess" => Ok(TransferStatus::InProcess),
            "Completed" => Ok(TransferStatus::Completed),
            "Failed" => Ok(TransferStatus::Failed),
            "Expired" => Ok(TransferStatus::Expired),
            other => Err(format!("unknown transfer status '{}'", other)),
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub from: TransferStatus,
    pub to: TransferStatus,
}
