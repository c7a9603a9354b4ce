//! Transfer request types and state machine.

use crate::{AccountId, Amount, BankError, RequestId, Result, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Waiting for the payer to respond.
    Pending,
    /// Payer accepted and the funds moved.
    Accepted,
    /// Payer declined.
    Rejected,
}

impl RequestStatus {
    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[RequestStatus] {
        match self {
            RequestStatus::Pending => &[RequestStatus::Accepted, RequestStatus::Rejected],
            RequestStatus::Accepted => &[],
            RequestStatus::Rejected => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Accepted => "accepted",
            RequestStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = BankError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "accepted" => Ok(RequestStatus::Accepted),
            "rejected" => Ok(RequestStatus::Rejected),
            other => Err(BankError::Internal(format!(
                "Unknown request status '{}'",
                other
            ))),
        }
    }
}

/// A pull-payment request: `from_user_id` asks `to_user_id` to send money
/// into `from_account_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub id: RequestId,
    /// Requester, receives the funds.
    pub from_user_id: UserId,
    /// Payer, asked to send the funds.
    pub to_user_id: UserId,
    /// Requester's receiving account.
    pub from_account_id: AccountId,
    /// Payer account suggested by the requester. Advisory only; the funding
    /// account is chosen at accept time.
    pub to_account_id: Option<AccountId>,
    pub amount: Amount,
    pub description: Option<String>,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl TransferRequest {
    /// Move to a terminal state, stamping `responded_at`.
    pub fn transition_to(&mut self, next: RequestStatus, at: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(BankError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.responded_at = Some(at);
        Ok(())
    }

    /// Check whether `user` is the payer of this request.
    pub fn is_payer(&self, user: UserId) -> bool {
        self.to_user_id == user
    }
}

/// Fields of a request before it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransferRequest {
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub from_account_id: AccountId,
    pub to_account_id: Option<AccountId>,
    pub amount: Amount,
    pub description: Option<String>,
}

impl NewTransferRequest {
    /// Materialise a Pending request with the given id.
    pub fn into_request(self, id: RequestId, created_at: DateTime<Utc>) -> TransferRequest {
        TransferRequest {
            id,
            from_user_id: self.from_user_id,
            to_user_id: self.to_user_id,
            from_account_id: self.from_account_id,
            to_account_id: self.to_account_id,
            amount: self.amount,
            description: self.description,
            status: RequestStatus::Pending,
            created_at,
            responded_at: None,
        }
    }
}
