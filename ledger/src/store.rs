//! Storage boundary.
//!
//! A [`LedgerStore`] hands out [`LedgerUnit`]s. Every balance mutation
//! happens inside a unit, and a unit either commits all of its writes or
//! none of them. Units that are dropped without `commit` roll back.

use async_trait::async_trait;
use bankcore_common::{
    AccountId, AlertId, Amount, ExternalRef, FraudAlert, HistoryEntry, NewFraudAlert,
    NewTransferRequest, RequestId, RequestStatus, Result, TransferRequest, UserId,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::account::Account;
use crate::journal::{NewTransaction, Transaction};

/// Connection-level handle, shared across tasks.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a new atomic unit.
    async fn begin(&self) -> Result<Box<dyn LedgerUnit>>;

    /// Read an account without locking it.
    async fn account(&self, id: AccountId) -> Result<Option<Account>>;

    /// Read an account by routing reference without locking it.
    async fn account_by_ref(&self, reference: &ExternalRef) -> Result<Option<Account>>;

    /// All accounts of a user, ordered by id.
    async fn accounts_for_owner(&self, owner: UserId) -> Result<Vec<Account>>;

    /// Most recent ledger rows touching an account, newest first.
    async fn transactions_for_account(
        &self,
        id: AccountId,
        limit: usize,
    ) -> Result<Vec<Transaction>>;

    async fn request(&self, id: RequestId) -> Result<Option<TransferRequest>>;

    /// Pending requests addressed to `payer`, newest first.
    async fn pending_requests_for(&self, payer: UserId) -> Result<Vec<TransferRequest>>;

    /// Persist a new Pending request.
    async fn insert_request(&self, request: NewTransferRequest) -> Result<TransferRequest>;

    /// Conditionally move a request from Pending to Rejected.
    ///
    /// The update only applies when the request is Pending and addressed to
    /// `payer`. Returns `None` when nothing matched; the caller decides why.
    async fn reject_request(
        &self,
        id: RequestId,
        payer: UserId,
        at: DateTime<Utc>,
    ) -> Result<Option<TransferRequest>>;
}

/// One atomic unit of work.
#[async_trait]
pub trait LedgerUnit: Send {
    /// Read an account and hold it exclusively until the unit ends.
    async fn lock_account(&mut self, id: AccountId) -> Result<Account>;

    /// Lock several accounts, always in ascending id order, so two units
    /// locking the same pair cannot wait on each other. Returns the accounts
    /// in that order, duplicates removed.
    async fn lock_accounts(&mut self, ids: &[AccountId]) -> Result<Vec<Account>> {
        let mut ordered = ids.to_vec();
        ordered.sort();
        ordered.dedup();
        let mut accounts = Vec::with_capacity(ordered.len());
        for id in ordered {
            accounts.push(self.lock_account(id).await?);
        }
        Ok(accounts)
    }

    /// Read an account through this unit without locking it.
    async fn account(&mut self, id: AccountId) -> Result<Account>;

    /// All accounts of a user, ordered by id, read through this unit.
    async fn accounts_for_owner(&mut self, owner: UserId) -> Result<Vec<Account>>;

    /// Resolve a destination by routing reference.
    async fn find_by_external_ref(&mut self, reference: &ExternalRef) -> Result<Account>;

    /// Ledger rows touching `id` since `since`, newest first, at most `limit`.
    async fn recent_history(
        &mut self,
        id: AccountId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>>;

    /// Decrease a locked account's balance. Returns the new balance.
    async fn debit(&mut self, id: AccountId, amount: Amount) -> Result<Decimal>;

    /// Increase an account's balance.
    async fn credit(&mut self, id: AccountId, amount: Amount) -> Result<()>;

    async fn append_ledger_row(&mut self, row: NewTransaction) -> Result<Transaction>;

    /// Read a request and hold it exclusively until the unit ends.
    async fn lock_request(&mut self, id: RequestId) -> Result<TransferRequest>;

    /// Move a locked request from `expected` to `next`.
    async fn mark_request(
        &mut self,
        id: RequestId,
        expected: RequestStatus,
        next: RequestStatus,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}

/// Fraud alert persistence.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn record(&self, alert: NewFraudAlert) -> Result<FraudAlert>;

    /// Alerts raised for a user, newest first.
    async fn alerts_for_user(&self, user: UserId, limit: usize) -> Result<Vec<FraudAlert>>;

    /// Alerts across all users, newest first.
    async fn recent_alerts(&self, limit: usize) -> Result<Vec<FraudAlert>>;

    /// Mark an alert resolved. Resolving twice keeps the first timestamp.
    async fn resolve(&self, id: AlertId) -> Result<FraudAlert>;
}
