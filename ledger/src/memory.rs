//! In-process ledger backend.
//!
//! Committed state lives behind one `RwLock`. A [`MemoryUnit`] reads
//! committed state, buffers its writes and applies them all under a single
//! write lock at commit. Exclusive account and request locks come from a
//! [`LockManager`]. Transfers lock both ends through
//! [`LedgerUnit::lock_accounts`]; a bare credit does not lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bankcore_common::{
    checked_balance, constants, AccountId, AlertId, AlertStatus, Amount, BankError, DurationExt,
    ExternalRef,
    FraudAlert, HistoryEntry, NewFraudAlert, NewTransferRequest, RequestId, RequestStatus,
    Result, TransactionId, TransferRequest, UserId,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tracing::{debug, instrument};

use crate::account::{Account, NewAccount};
use crate::journal::{NewTransaction, Transaction};
use crate::lock_manager::{LockGuard, LockKey, LockManager, LockStats};
use crate::store::{AlertSink, LedgerStore, LedgerUnit};

/// Operations a test can make fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Debit,
    Credit,
    AppendRow,
    MarkRequest,
    Commit,
    RecordAlert,
}

#[derive(Default)]
struct FaultInjector {
    armed: Mutex<HashSet<FailPoint>>,
}

impl FaultInjector {
    fn check(&self, point: FailPoint) -> Result<()> {
        if self.armed.lock().remove(&point) {
            return Err(BankError::Storage(format!("injected failure at {:?}", point)));
        }
        Ok(())
    }
}

#[derive(Default)]
struct State {
    accounts: BTreeMap<AccountId, Account>,
    by_ref: HashMap<ExternalRef, AccountId>,
    transactions: Vec<Transaction>,
    requests: BTreeMap<RequestId, TransferRequest>,
    alerts: BTreeMap<AlertId, FraudAlert>,
}

impl State {
    fn account(&self, id: AccountId) -> Result<&Account> {
        self.accounts.get(&id).ok_or(BankError::AccountNotFound(id))
    }
}

/// Totals used to check conservation.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerSnapshot {
    pub accounts: Vec<Account>,
    pub total_balance: Decimal,
    pub transaction_count: usize,
    pub deposit_total: Decimal,
    pub negative_accounts: usize,
}

#[derive(Default)]
struct Sequences {
    account: AtomicI64,
    transaction: AtomicI64,
    request: AtomicI64,
    alert: AtomicI64,
}

fn next(seq: &AtomicI64) -> i64 {
    seq.fetch_add(1, Ordering::Relaxed) + 1
}

struct Shared {
    state: RwLock<State>,
    seq: Sequences,
    locks: Arc<LockManager>,
    faults: FaultInjector,
}

/// In-memory [`LedgerStore`] and [`AlertSink`].
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store with the default lock timeout.
    pub fn new() -> Self {
        Self::with_lock_timeout(constants::lock_acquisition_timeout().as_std())
    }

    pub fn with_lock_timeout(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(State::default()),
                seq: Sequences::default(),
                locks: Arc::new(LockManager::new(timeout)),
                faults: FaultInjector::default(),
            }),
        }
    }

    /// Seed an account with a zero balance. Fixture path, not a public API.
    pub fn open_account(&self, account: NewAccount) -> Result<Account> {
        account.validate()?;
        let mut state = self.shared.state.write();
        if state.by_ref.contains_key(&account.external_ref) {
            return Err(BankError::Storage(format!(
                "duplicate external_ref '{}'",
                account.external_ref
            )));
        }

        let now = Utc::now();
        let created = Account {
            id: AccountId::new(next(&self.shared.seq.account)),
            owner_id: account.owner_id,
            balance: Decimal::ZERO,
            currency: account.currency,
            external_ref: account.external_ref,
            created_at: now,
            updated_at: now,
        };
        state.by_ref.insert(created.external_ref.clone(), created.id);
        state.accounts.insert(created.id, created.clone());
        Ok(created)
    }

    pub fn lock_manager(&self) -> Arc<LockManager> {
        self.shared.locks.clone()
    }

    pub fn lock_stats(&self) -> LockStats {
        self.shared.locks.stats()
    }

    /// Consistent view of all balances and ledger totals.
    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.shared.state.read();
        let accounts: Vec<Account> = state.accounts.values().cloned().collect();
        LedgerSnapshot {
            total_balance: accounts.iter().map(|a| a.balance).sum(),
            negative_accounts: accounts.iter().filter(|a| a.balance < Decimal::ZERO).count(),
            transaction_count: state.transactions.len(),
            deposit_total: state
                .transactions
                .iter()
                .filter(|t| t.is_external_credit())
                .map(|t| t.amount.value())
                .sum(),
            accounts,
        }
    }

    /// Make the next call at `point` fail with a storage error.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn fail_next(&self, point: FailPoint) {
        self.shared.faults.armed.lock().insert(point);
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn LedgerUnit>> {
        Ok(Box::new(MemoryUnit::new(self.shared.clone())))
    }

    async fn account(&self, id: AccountId) -> Result<Option<Account>> {
        Ok(self.shared.state.read().accounts.get(&id).cloned())
    }

    async fn account_by_ref(&self, reference: &ExternalRef) -> Result<Option<Account>> {
        let state = self.shared.state.read();
        Ok(state
            .by_ref
            .get(reference)
            .and_then(|id| state.accounts.get(id))
            .cloned())
    }

    async fn accounts_for_owner(&self, owner: UserId) -> Result<Vec<Account>> {
        Ok(self
            .shared
            .state
            .read()
            .accounts
            .values()
            .filter(|a| a.owner_id == owner)
            .cloned()
            .collect())
    }

    async fn transactions_for_account(
        &self,
        id: AccountId,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let state = self.shared.state.read();
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|t| t.touches(id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn request(&self, id: RequestId) -> Result<Option<TransferRequest>> {
        Ok(self.shared.state.read().requests.get(&id).cloned())
    }

    async fn pending_requests_for(&self, payer: UserId) -> Result<Vec<TransferRequest>> {
        let state = self.shared.state.read();
        Ok(state
            .requests
            .values()
            .rev()
            .filter(|r| r.to_user_id == payer && r.status == RequestStatus::Pending)
            .cloned()
            .collect())
    }

    async fn insert_request(&self, request: NewTransferRequest) -> Result<TransferRequest> {
        let mut state = self.shared.state.write();
        state.account(request.from_account_id)?;
        let request = request.into_request(
            RequestId::new(next(&self.shared.seq.request)),
            Utc::now(),
        );
        state.requests.insert(request.id, request.clone());
        Ok(request)
    }

    #[instrument(skip(self))]
    async fn reject_request(
        &self,
        id: RequestId,
        payer: UserId,
        at: DateTime<Utc>,
    ) -> Result<Option<TransferRequest>> {
        // Wait out any unit currently accepting this request.
        let _guard = self.shared.locks.acquire(LockKey::Request(id)).await?;

        let mut state = self.shared.state.write();
        match state.requests.get_mut(&id) {
            Some(request) if request.is_payer(payer) && request.status == RequestStatus::Pending => {
                request.transition_to(RequestStatus::Rejected, at)?;
                Ok(Some(request.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl AlertSink for MemoryStore {
    async fn record(&self, alert: NewFraudAlert) -> Result<FraudAlert> {
        self.shared.faults.check(FailPoint::RecordAlert)?;
        let alert = alert.into_alert(AlertId::new(next(&self.shared.seq.alert)), Utc::now());
        self.shared
            .state
            .write()
            .alerts
            .insert(alert.id, alert.clone());
        Ok(alert)
    }

    async fn alerts_for_user(&self, user: UserId, limit: usize) -> Result<Vec<FraudAlert>> {
        let state = self.shared.state.read();
        Ok(state
            .alerts
            .values()
            .rev()
            .filter(|a| a.user_id == user)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn recent_alerts(&self, limit: usize) -> Result<Vec<FraudAlert>> {
        let state = self.shared.state.read();
        Ok(state.alerts.values().rev().take(limit).cloned().collect())
    }

    async fn resolve(&self, id: AlertId) -> Result<FraudAlert> {
        let mut state = self.shared.state.write();
        let alert = state
            .alerts
            .get_mut(&id)
            .ok_or(BankError::AlertNotFound(id))?;
        if alert.status != AlertStatus::Resolved {
            alert.status = AlertStatus::Resolved;
            alert.resolved_at = Some(Utc::now());
        }
        Ok(alert.clone())
    }
}

struct StagedRequest {
    id: RequestId,
    expected: RequestStatus,
    next: RequestStatus,
    at: DateTime<Utc>,
}

/// A buffered unit over [`MemoryStore`].
pub struct MemoryUnit {
    shared: Arc<Shared>,
    guards: Vec<LockGuard>,
    deltas: BTreeMap<AccountId, Decimal>,
    rows: Vec<Transaction>,
    requests: Vec<StagedRequest>,
    finished: bool,
}

impl MemoryUnit {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            guards: Vec::new(),
            deltas: BTreeMap::new(),
            rows: Vec::new(),
            requests: Vec::new(),
            finished: false,
        }
    }

    fn holds(&self, key: LockKey) -> bool {
        self.guards.iter().any(|g| g.key() == key)
    }

    async fn lock(&mut self, key: LockKey) -> Result<()> {
        if !self.holds(key) {
            let guard = self.shared.locks.acquire(key).await?;
            self.guards.push(guard);
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finished {
            return Err(BankError::Internal("unit already finished".to_string()));
        }
        Ok(())
    }

    fn pending_delta(&self, id: AccountId) -> Decimal {
        self.deltas.get(&id).copied().unwrap_or(Decimal::ZERO)
    }

    /// Check staged writes against committed state before applying any.
    /// Returns the balance each touched account ends up with.
    fn validate(&self, state: &State) -> Result<Vec<(AccountId, Decimal)>> {
        let mut balances = Vec::with_capacity(self.deltas.len());
        for (id, delta) in &self.deltas {
            let account = state.account(*id)?;
            let balance = checked_balance(account.balance, *delta)?;
            if balance < Decimal::ZERO {
                return Err(BankError::InsufficientFunds {
                    required: (-*delta).to_string(),
                    available: account.balance.to_string(),
                });
            }
            balances.push((*id, balance));
        }
        for staged in &self.requests {
            let status = state
                .requests
                .get(&staged.id)
                .map(|r| r.status)
                .ok_or(BankError::RequestNotFound(staged.id))?;
            if status != staged.expected {
                return Err(BankError::AlreadyProcessed {
                    id: staged.id,
                    status,
                });
            }
        }
        Ok(balances)
    }

    fn finish(&mut self) {
        self.deltas.clear();
        self.rows.clear();
        self.requests.clear();
        self.guards.clear();
        self.finished = true;
    }
}

#[async_trait]
impl LedgerUnit for MemoryUnit {
    async fn lock_account(&mut self, id: AccountId) -> Result<Account> {
        self.ensure_open()?;
        self.lock(LockKey::Account(id)).await?;
        let mut account = self.shared.state.read().account(id)?.clone();
        account.balance = checked_balance(account.balance, self.pending_delta(id))?;
        Ok(account)
    }

    async fn account(&mut self, id: AccountId) -> Result<Account> {
        self.ensure_open()?;
        let mut account = self.shared.state.read().account(id)?.clone();
        account.balance = checked_balance(account.balance, self.pending_delta(id))?;
        Ok(account)
    }

    async fn accounts_for_owner(&mut self, owner: UserId) -> Result<Vec<Account>> {
        self.ensure_open()?;
        let state = self.shared.state.read();
        state
            .accounts
            .values()
            .filter(|a| a.owner_id == owner)
            .map(|a| {
                let mut account = a.clone();
                account.balance = checked_balance(account.balance, self.pending_delta(a.id))?;
                Ok(account)
            })
            .collect()
    }

    async fn find_by_external_ref(&mut self, reference: &ExternalRef) -> Result<Account> {
        self.ensure_open()?;
        let state = self.shared.state.read();
        state
            .by_ref
            .get(reference)
            .and_then(|id| state.accounts.get(id))
            .cloned()
            .ok_or_else(|| BankError::DestinationNotFound(reference.to_string()))
    }

    async fn recent_history(
        &mut self,
        id: AccountId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>> {
        self.ensure_open()?;
        let state = self.shared.state.read();
        let mut rows: Vec<&Transaction> = state
            .transactions
            .iter()
            .filter(|t| t.touches(id) && t.created_at >= since)
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(rows
            .into_iter()
            .take(limit)
            .map(Transaction::to_history_entry)
            .collect())
    }

    async fn debit(&mut self, id: AccountId, amount: Amount) -> Result<Decimal> {
        self.ensure_open()?;
        if !self.holds(LockKey::Account(id)) {
            return Err(BankError::Internal(format!(
                "debit of account {} without holding its lock",
                id
            )));
        }
        self.shared.faults.check(FailPoint::Debit)?;

        let committed = self.shared.state.read().account(id)?.balance;
        let available = checked_balance(committed, self.pending_delta(id))?;
        if available < amount.value() {
            return Err(BankError::InsufficientFunds {
                required: amount.to_string(),
                available: available.to_string(),
            });
        }
        let delta = checked_balance(self.pending_delta(id), -amount.value())?;
        self.deltas.insert(id, delta);
        Ok(available - amount.value())
    }

    async fn credit(&mut self, id: AccountId, amount: Amount) -> Result<()> {
        self.ensure_open()?;
        self.shared.faults.check(FailPoint::Credit)?;
        let committed = self.shared.state.read().account(id)?.balance;
        let delta = checked_balance(self.pending_delta(id), amount.value())?;
        checked_balance(committed, delta)?;
        self.deltas.insert(id, delta);
        Ok(())
    }

    async fn append_ledger_row(&mut self, row: NewTransaction) -> Result<Transaction> {
        self.ensure_open()?;
        self.shared.faults.check(FailPoint::AppendRow)?;
        let row = row.into_transaction(
            TransactionId::new(next(&self.shared.seq.transaction)),
            Utc::now(),
        );
        self.rows.push(row.clone());
        Ok(row)
    }

    async fn lock_request(&mut self, id: RequestId) -> Result<TransferRequest> {
        self.ensure_open()?;
        self.lock(LockKey::Request(id)).await?;
        self.shared
            .state
            .read()
            .requests
            .get(&id)
            .cloned()
            .ok_or(BankError::RequestNotFound(id))
    }

    async fn mark_request(
        &mut self,
        id: RequestId,
        expected: RequestStatus,
        next: RequestStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_open()?;
        if !self.holds(LockKey::Request(id)) {
            return Err(BankError::Internal(format!(
                "update of request {} without holding its lock",
                id
            )));
        }
        if !expected.can_transition_to(next) {
            return Err(BankError::InvalidTransition {
                from: expected,
                to: next,
            });
        }
        self.shared.faults.check(FailPoint::MarkRequest)?;

        let current = self
            .shared
            .state
            .read()
            .requests
            .get(&id)
            .map(|r| r.status)
            .ok_or(BankError::RequestNotFound(id))?;
        if current != expected {
            return Err(BankError::AlreadyProcessed {
                id,
                status: current,
            });
        }
        self.requests.push(StagedRequest {
            id,
            expected,
            next,
            at,
        });
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        if let Err(e) = self.shared.faults.check(FailPoint::Commit) {
            self.finish();
            return Err(e);
        }

        let shared = self.shared.clone();
        let mut state = shared.state.write();
        let balances = match self.validate(&state) {
            Ok(balances) => balances,
            Err(e) => {
                drop(state);
                self.finish();
                return Err(e);
            }
        };

        let now = Utc::now();
        for (id, balance) in balances {
            if let Some(account) = state.accounts.get_mut(&id) {
                account.balance = balance;
                account.updated_at = now;
            }
        }
        for staged in &self.requests {
            if let Some(request) = state.requests.get_mut(&staged.id) {
                request.status = staged.next;
                request.responded_at = Some(staged.at);
            }
        }
        state.transactions.append(&mut self.rows);
        drop(state);

        debug!(
            accounts = self.deltas.len(),
            requests = self.requests.len(),
            "Unit committed"
        );
        self.finish();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if !self.finished {
            debug!(rows = self.rows.len(), "Unit rolled back");
            self.finish();
        }
        Ok(())
    }
}

impl Drop for MemoryUnit {
    fn drop(&mut self) {
        if !self.finished && (!self.deltas.is_empty() || !self.rows.is_empty()) {
            debug!("Unit dropped without commit, discarding staged writes");
        }
    }
}
