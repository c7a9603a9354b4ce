//! Fraud alert records.

use crate::{AlertId, BankError, CandidateTransaction, Result, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Alert status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    /// Advisory flag raised by a pre-check; nothing was blocked.
    Pending,
    /// A transfer was vetoed.
    Blocked,
    /// Reviewed and closed.
    Resolved,
}

impl AlertStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Pending => "pending",
            AlertStatus::Blocked => "blocked",
            AlertStatus::Resolved => "resolved",
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertStatus {
    type Err = BankError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(AlertStatus::Pending),
            "blocked" => Ok(AlertStatus::Blocked),
            "resolved" => Ok(AlertStatus::Resolved),
            other => Err(BankError::Internal(format!(
                "Unknown alert status '{}'",
                other
            ))),
        }
    }
}

/// A persisted fraud alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudAlert {
    pub id: AlertId,
    pub user_id: UserId,
    /// Snapshot of the transfer that triggered the alert.
    pub transaction: CandidateTransaction,
    pub risk_score: f64,
    pub reason: String,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Alert fields before persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFraudAlert {
    pub user_id: UserId,
    pub transaction: CandidateTransaction,
    pub risk_score: f64,
    pub reason: String,
    pub status: AlertStatus,
}

impl NewFraudAlert {
    /// Materialise with the given id.
    pub fn into_alert(self, id: AlertId, created_at: DateTime<Utc>) -> FraudAlert {
        FraudAlert {
            id,
            user_id: self.user_id,
            transaction: self.transaction,
            risk_score: self.risk_score,
            reason: self.reason,
            status: self.status,
            created_at,
            resolved_at: None,
        }
    }
}
