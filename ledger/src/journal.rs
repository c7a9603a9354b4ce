//! Ledger rows.
//!
//! One row per committed movement. Rows are immutable and are only written
//! inside the same atomic unit as the balance mutations they describe.

use bankcore_common::{AccountId, Amount, HistoryEntry, TransactionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A committed ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique row ID.
    pub id: TransactionId,
    /// Debited account. `None` for an external credit (deposit).
    pub from_account_id: Option<AccountId>,
    /// Credited account.
    pub to_account_id: AccountId,
    /// Amount moved.
    pub amount: Amount,
    /// Free-form memo.
    pub description: Option<String>,
    /// When the row was written.
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Check if this row records funds entering from outside the ledger.
    pub fn is_external_credit(&self) -> bool {
        self.from_account_id.is_none()
    }

    /// Check if the row debits or credits `account`.
    pub fn touches(&self, account: AccountId) -> bool {
        self.from_account_id == Some(account) || self.to_account_id == account
    }

    /// Project into the shape the risk gate consumes.
    pub fn to_history_entry(&self) -> HistoryEntry {
        HistoryEntry {
            amount: self.amount.value(),
            timestamp: self.created_at,
            description: self.description.clone(),
        }
    }
}

/// A row to append.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub from_account_id: Option<AccountId>,
    pub to_account_id: AccountId,
    pub amount: Amount,
    pub description: Option<String>,
}

impl NewTransaction {
    /// Internal transfer between two accounts.
    pub fn transfer(
        from: AccountId,
        to: AccountId,
        amount: Amount,
        description: Option<String>,
    ) -> Self {
        Self {
            from_account_id: Some(from),
            to_account_id: to,
            amount,
            description,
        }
    }

    /// External credit into `to`.
    pub fn deposit(to: AccountId, amount: Amount, description: Option<String>) -> Self {
        Self {
            from_account_id: None,
            to_account_id: to,
            amount,
            description,
        }
    }

    /// Materialise with the given id.
    pub fn into_transaction(self, id: TransactionId, created_at: DateTime<Utc>) -> Transaction {
        Transaction {
            id,
            from_account_id: self.from_account_id,
            to_account_id: self.to_account_id,
            amount: self.amount,
            description: self.description,
            created_at,
        }
    }
}
