//! Account definitions for the ledger.

use bankcore_common::{AccountId, Amount, BankError, Currency, ExternalRef, Result, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A customer account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Unique account identifier.
    pub id: AccountId,
    /// Owning user.
    pub owner_id: UserId,
    /// Current balance. Never negative.
    pub balance: Decimal,
    /// Account currency.
    pub currency: Currency,
    /// Routing reference other users address transfers to.
    pub external_ref: ExternalRef,
    /// When the account was created.
    pub created_at: DateTime<Utc>,
    /// When the balance last changed.
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Check whether `user` owns this account.
    pub fn is_owned_by(&self, user: UserId) -> bool {
        self.owner_id == user
    }

    /// Fail with `Forbidden` unless `user` owns this account.
    pub fn ensure_owned_by(&self, user: UserId, action: &str) -> Result<()> {
        if self.is_owned_by(user) {
            Ok(())
        } else {
            Err(BankError::forbidden(
                user,
                format!("{} account {}", action, self.id),
            ))
        }
    }

    /// Check if the balance covers `amount`.
    pub fn has_sufficient_funds(&self, amount: Amount) -> bool {
        self.balance >= amount.value()
    }

    /// Fail with `InsufficientFunds` unless the balance covers `amount`.
    pub fn ensure_funds(&self, amount: Amount) -> Result<()> {
        if self.has_sufficient_funds(amount) {
            Ok(())
        } else {
            Err(BankError::InsufficientFunds {
                required: amount.to_string(),
                available: self.balance.to_string(),
            })
        }
    }
}

/// Fields for seeding an account directly through a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAccount {
    pub owner_id: UserId,
    pub currency: Currency,
    pub external_ref: ExternalRef,
}

impl NewAccount {
    pub fn new(owner_id: UserId, external_ref: impl Into<ExternalRef>) -> Self {
        Self {
            owner_id,
            currency: Currency::default(),
            external_ref: external_ref.into(),
        }
    }

    pub fn with_currency(mut self, currency: Currency) -> Self {
        self.currency = currency;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.external_ref.is_valid() {
            return Err(BankError::Validation {
                message: format!("Invalid external reference '{}'", self.external_ref),
                field: Some("external_ref".to_string()),
            });
        }
        Ok(())
    }
}
