//! PostgreSQL ledger backend.
//!
//! Each [`PgUnit`] wraps one `sqlx` transaction. Accounts and requests are
//! locked with `SELECT ... FOR UPDATE` and stay locked until the transaction
//! ends. Dropping a unit without committing rolls the transaction back.

use std::time::Duration;

use async_trait::async_trait;
use bankcore_common::{
    AccountId, AlertId, AlertStatus, Amount, BankError, CandidateTransaction, Currency,
    ExternalRef, FraudAlert, HistoryEntry, NewFraudAlert, NewTransferRequest, RequestId,
    RequestStatus, Result, TransactionId, TransferRequest, UserId,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Postgres;
use tracing::{debug, instrument, warn};

use crate::account::{Account, NewAccount};
use crate::journal::{NewTransaction, Transaction};
use crate::store::{AlertSink, LedgerStore, LedgerUnit};

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Minimum number of connections to maintain.
    pub min_connections: u32,
    /// Connection acquisition timeout.
    pub acquire_timeout: Duration,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/bankcore".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl DatabaseConfig {
    /// Create config from `DATABASE_URL` and `DATABASE_MAX_CONNECTIONS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("DATABASE_URL").unwrap_or(defaults.url),
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            ..defaults
        }
    }
}

const ACCOUNT_COLUMNS: &str =
    "id, owner_id, balance, currency, external_ref, created_at, updated_at";
const TRANSACTION_COLUMNS: &str =
    "id, from_account_id, to_account_id, amount, description, created_at";
const REQUEST_COLUMNS: &str = "id, from_user_id, to_user_id, from_account_id, to_account_id, \
     amount, description, status, created_at, responded_at";
const ALERT_COLUMNS: &str =
    "id, user_id, transaction_data, risk_score, reason, status, created_at, resolved_at";

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: i64,
    owner_id: i64,
    balance: Decimal,
    currency: String,
    external_ref: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Self {
            id: AccountId::new(row.id),
            owner_id: UserId::new(row.owner_id),
            balance: row.balance,
            currency: Currency::new(row.currency),
            external_ref: ExternalRef::new(row.external_ref),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: i64,
    from_account_id: Option<i64>,
    to_account_id: i64,
    amount: Decimal,
    description: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = BankError;

    fn try_from(row: TransactionRow) -> Result<Self> {
        Ok(Self {
            id: TransactionId::new(row.id),
            from_account_id: row.from_account_id.map(AccountId::new),
            to_account_id: AccountId::new(row.to_account_id),
            amount: stored_amount(row.amount)?,
            description: row.description,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RequestRow {
    id: i64,
    from_user_id: i64,
    to_user_id: i64,
    from_account_id: i64,
    to_account_id: Option<i64>,
    amount: Decimal,
    description: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    responded_at: Option<DateTime<Utc>>,
}

impl TryFrom<RequestRow> for TransferRequest {
    type Error = BankError;

    fn try_from(row: RequestRow) -> Result<Self> {
        Ok(Self {
            id: RequestId::new(row.id),
            from_user_id: UserId::new(row.from_user_id),
            to_user_id: UserId::new(row.to_user_id),
            from_account_id: AccountId::new(row.from_account_id),
            to_account_id: row.to_account_id.map(AccountId::new),
            amount: stored_amount(row.amount)?,
            description: row.description,
            status: row.status.parse()?,
            created_at: row.created_at,
            responded_at: row.responded_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AlertRow {
    id: i64,
    user_id: i64,
    transaction_data: Json<CandidateTransaction>,
    risk_score: f64,
    reason: String,
    status: String,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<AlertRow> for FraudAlert {
    type Error = BankError;

    fn try_from(row: AlertRow) -> Result<Self> {
        Ok(Self {
            id: AlertId::new(row.id),
            user_id: UserId::new(row.user_id),
            transaction: row.transaction_data.0,
            risk_score: row.risk_score,
            reason: row.reason,
            status: row.status.parse()?,
            created_at: row.created_at,
            resolved_at: row.resolved_at,
        })
    }
}

fn stored_amount(value: Decimal) -> Result<Amount> {
    Amount::new(value)
        .map_err(|e| BankError::Internal(format!("corrupt amount {} in storage: {}", value, e)))
}

fn storage_error(error: sqlx::Error) -> BankError {
    if let Some(db) = error.as_database_error() {
        match db.code().as_deref() {
            Some("23505") => {
                return BankError::Storage(format!("unique violation: {}", db.message()))
            }
            Some("40P01") => {
                return BankError::Storage(format!("deadlock detected: {}", db.message()))
            }
            Some("40001") => {
                return BankError::Storage(format!("serialization failure: {}", db.message()))
            }
            Some("22003") => {
                return BankError::Validation {
                    message: format!("balance out of range: {}", db.message()),
                    field: Some("amount".to_string()),
                }
            }
            _ => {}
        }
    }
    BankError::storage(error)
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// PostgreSQL [`LedgerStore`] and [`AlertSink`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database with the given configuration.
    #[instrument(skip_all)]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        debug!(
            max_conn = config.max_connections,
            min_conn = config.min_connections,
            "Creating connection pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect(&config.url)
            .await
            .map_err(storage_error)?;

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BankError::Storage(format!("migration failed: {}", e)))?;
        debug!("Migrations completed");
        Ok(())
    }

    /// Seed an account with a zero balance. Fixture path, not a public API.
    pub async fn open_account(&self, account: NewAccount) -> Result<Account> {
        account.validate()?;
        let row: AccountRow = sqlx::query_as(&format!(
            "INSERT INTO accounts (owner_id, currency, external_ref) VALUES ($1, $2, $3) \
             RETURNING {}",
            ACCOUNT_COLUMNS
        ))
        .bind(account.owner_id.value())
        .bind(account.currency.code())
        .bind(account.external_ref.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(row.into())
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn LedgerUnit>> {
        let tx = self.pool.begin().await.map_err(storage_error)?;
        Ok(Box::new(PgUnit { tx: Some(tx) }))
    }

    async fn account(&self, id: AccountId) -> Result<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM accounts WHERE id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(id.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(row.map(Account::from))
    }

    async fn account_by_ref(&self, reference: &ExternalRef) -> Result<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM accounts WHERE external_ref = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(reference.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(row.map(Account::from))
    }

    async fn accounts_for_owner(&self, owner: UserId) -> Result<Vec<Account>> {
        let rows: Vec<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM accounts WHERE owner_id = $1 ORDER BY id",
            ACCOUNT_COLUMNS
        ))
        .bind(owner.value())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(rows.into_iter().map(Account::from).collect())
    }

    async fn transactions_for_account(
        &self,
        id: AccountId,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM transactions \
             WHERE from_account_id = $1 OR to_account_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2",
            TRANSACTION_COLUMNS
        ))
        .bind(id.value())
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;
        rows.into_iter().map(Transaction::try_from).collect()
    }

    async fn request(&self, id: RequestId) -> Result<Option<TransferRequest>> {
        let row: Option<RequestRow> = sqlx::query_as(&format!(
            "SELECT {} FROM transfer_requests WHERE id = $1",
            REQUEST_COLUMNS
        ))
        .bind(id.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;
        row.map(TransferRequest::try_from).transpose()
    }

    async fn pending_requests_for(&self, payer: UserId) -> Result<Vec<TransferRequest>> {
        let rows: Vec<RequestRow> = sqlx::query_as(&format!(
            "SELECT {} FROM transfer_requests WHERE to_user_id = $1 AND status = 'pending' \
             ORDER BY created_at DESC, id DESC",
            REQUEST_COLUMNS
        ))
        .bind(payer.value())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;
        rows.into_iter().map(TransferRequest::try_from).collect()
    }

    async fn insert_request(&self, request: NewTransferRequest) -> Result<TransferRequest> {
        let row: RequestRow = sqlx::query_as(&format!(
            "INSERT INTO transfer_requests \
             (from_user_id, to_user_id, from_account_id, to_account_id, amount, description) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {}",
            REQUEST_COLUMNS
        ))
        .bind(request.from_user_id.value())
        .bind(request.to_user_id.value())
        .bind(request.from_account_id.value())
        .bind(request.to_account_id.map(|id| id.value()))
        .bind(request.amount.value())
        .bind(request.description)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)?;
        row.try_into()
    }

    #[instrument(skip(self))]
    async fn reject_request(
        &self,
        id: RequestId,
        payer: UserId,
        at: DateTime<Utc>,
    ) -> Result<Option<TransferRequest>> {
        // A concurrent accept holding the row lock makes this wait, then
        // re-check the status predicate against the committed row.
        let row: Option<RequestRow> = sqlx::query_as(&format!(
            "UPDATE transfer_requests SET status = 'rejected', responded_at = $3 \
             WHERE id = $1 AND to_user_id = $2 AND status = 'pending' RETURNING {}",
            REQUEST_COLUMNS
        ))
        .bind(id.value())
        .bind(payer.value())
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;
        row.map(TransferRequest::try_from).transpose()
    }
}

#[async_trait]
impl AlertSink for PgStore {
    async fn record(&self, alert: NewFraudAlert) -> Result<FraudAlert> {
        let row: AlertRow = sqlx::query_as(&format!(
            "INSERT INTO fraud_alerts (user_id, transaction_data, risk_score, reason, status) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {}",
            ALERT_COLUMNS
        ))
        .bind(alert.user_id.value())
        .bind(Json(&alert.transaction))
        .bind(alert.risk_score)
        .bind(alert.reason.as_str())
        .bind(alert.status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)?;
        row.try_into()
    }

    async fn alerts_for_user(&self, user: UserId, limit: usize) -> Result<Vec<FraudAlert>> {
        let rows: Vec<AlertRow> = sqlx::query_as(&format!(
            "SELECT {} FROM fraud_alerts WHERE user_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2",
            ALERT_COLUMNS
        ))
        .bind(user.value())
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;
        rows.into_iter().map(FraudAlert::try_from).collect()
    }

    async fn recent_alerts(&self, limit: usize) -> Result<Vec<FraudAlert>> {
        let rows: Vec<AlertRow> = sqlx::query_as(&format!(
            "SELECT {} FROM fraud_alerts ORDER BY created_at DESC, id DESC LIMIT $1",
            ALERT_COLUMNS
        ))
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;
        rows.into_iter().map(FraudAlert::try_from).collect()
    }

    async fn resolve(&self, id: AlertId) -> Result<FraudAlert> {
        let row: Option<AlertRow> = sqlx::query_as(&format!(
            "UPDATE fraud_alerts SET status = $2, resolved_at = COALESCE(resolved_at, NOW()) \
             WHERE id = $1 RETURNING {}",
            ALERT_COLUMNS
        ))
        .bind(id.value())
        .bind(AlertStatus::Resolved.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;
        row.ok_or(BankError::AlertNotFound(id))?.try_into()
    }
}

/// One PostgreSQL transaction.
pub struct PgUnit {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PgUnit {
    fn conn(&mut self) -> Result<&mut PgConnection> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| BankError::Internal("unit already finished".to_string()))
    }

    async fn current_balance(&mut self, id: AccountId) -> Result<Decimal> {
        let balance: Option<Decimal> =
            sqlx::query_scalar("SELECT balance FROM accounts WHERE id = $1")
                .bind(id.value())
                .fetch_optional(self.conn()?)
                .await
                .map_err(storage_error)?;
        balance.ok_or(BankError::AccountNotFound(id))
    }
}

#[async_trait]
impl LedgerUnit for PgUnit {
    async fn lock_account(&mut self, id: AccountId) -> Result<Account> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM accounts WHERE id = $1 FOR UPDATE",
            ACCOUNT_COLUMNS
        ))
        .bind(id.value())
        .fetch_optional(self.conn()?)
        .await
        .map_err(storage_error)?;
        row.map(Account::from)
            .ok_or(BankError::AccountNotFound(id))
    }

    async fn lock_accounts(&mut self, ids: &[AccountId]) -> Result<Vec<Account>> {
        let mut ordered: Vec<i64> = ids.iter().map(|id| id.value()).collect();
        ordered.sort_unstable();
        ordered.dedup();
        let rows: Vec<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM accounts WHERE id = ANY($1) ORDER BY id FOR UPDATE",
            ACCOUNT_COLUMNS
        ))
        .bind(ordered.clone())
        .fetch_all(self.conn()?)
        .await
        .map_err(storage_error)?;

        let accounts: Vec<Account> = rows.into_iter().map(Account::from).collect();
        if let Some(missing) = ordered
            .iter()
            .find(|id| !accounts.iter().any(|a| a.id.value() == **id))
        {
            return Err(BankError::AccountNotFound(AccountId::new(*missing)));
        }
        Ok(accounts)
    }

    async fn account(&mut self, id: AccountId) -> Result<Account> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM accounts WHERE id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(id.value())
        .fetch_optional(self.conn()?)
        .await
        .map_err(storage_error)?;
        row.map(Account::from)
            .ok_or(BankError::AccountNotFound(id))
    }

    async fn accounts_for_owner(&mut self, owner: UserId) -> Result<Vec<Account>> {
        let rows: Vec<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM accounts WHERE owner_id = $1 ORDER BY id",
            ACCOUNT_COLUMNS
        ))
        .bind(owner.value())
        .fetch_all(self.conn()?)
        .await
        .map_err(storage_error)?;
        Ok(rows.into_iter().map(Account::from).collect())
    }

    async fn find_by_external_ref(&mut self, reference: &ExternalRef) -> Result<Account> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM accounts WHERE external_ref = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(reference.as_str())
        .fetch_optional(self.conn()?)
        .await
        .map_err(storage_error)?;
        row.map(Account::from)
            .ok_or_else(|| BankError::DestinationNotFound(reference.to_string()))
    }

    async fn recent_history(
        &mut self,
        id: AccountId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM transactions \
             WHERE (from_account_id = $1 OR to_account_id = $1) AND created_at >= $2 \
             ORDER BY created_at DESC, id DESC LIMIT $3",
            TRANSACTION_COLUMNS
        ))
        .bind(id.value())
        .bind(since)
        .bind(limit_param(limit))
        .fetch_all(self.conn()?)
        .await
        .map_err(storage_error)?;
        rows.into_iter()
            .map(|row| Transaction::try_from(row).map(|t| t.to_history_entry()))
            .collect()
    }

    async fn debit(&mut self, id: AccountId, amount: Amount) -> Result<Decimal> {
        let updated: Option<Decimal> = sqlx::query_scalar(
            "UPDATE accounts SET balance = balance - $1, updated_at = NOW() \
             WHERE id = $2 AND balance >= $1 RETURNING balance",
        )
        .bind(amount.value())
        .bind(id.value())
        .fetch_optional(self.conn()?)
        .await
        .map_err(storage_error)?;

        match updated {
            Some(balance) => Ok(balance),
            None => {
                let available = self.current_balance(id).await?;
                Err(BankError::InsufficientFunds {
                    required: amount.to_string(),
                    available: available.to_string(),
                })
            }
        }
    }

    async fn credit(&mut self, id: AccountId, amount: Amount) -> Result<()> {
        let result = sqlx::query(
            "UPDATE accounts SET balance = balance + $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(amount.value())
        .bind(id.value())
        .execute(self.conn()?)
        .await
        .map_err(storage_error)?;
        if result.rows_affected() == 0 {
            return Err(BankError::AccountNotFound(id));
        }
        Ok(())
    }

    async fn append_ledger_row(&mut self, row: NewTransaction) -> Result<Transaction> {
        let inserted: TransactionRow = sqlx::query_as(&format!(
            "INSERT INTO transactions (from_account_id, to_account_id, amount, description) \
             VALUES ($1, $2, $3, $4) RETURNING {}",
            TRANSACTION_COLUMNS
        ))
        .bind(row.from_account_id.map(|id| id.value()))
        .bind(row.to_account_id.value())
        .bind(row.amount.value())
        .bind(row.description)
        .fetch_one(self.conn()?)
        .await
        .map_err(storage_error)?;
        inserted.try_into()
    }

    async fn lock_request(&mut self, id: RequestId) -> Result<TransferRequest> {
        let row: Option<RequestRow> = sqlx::query_as(&format!(
            "SELECT {} FROM transfer_requests WHERE id = $1 FOR UPDATE",
            REQUEST_COLUMNS
        ))
        .bind(id.value())
        .fetch_optional(self.conn()?)
        .await
        .map_err(storage_error)?;
        row.ok_or(BankError::RequestNotFound(id))?.try_into()
    }

    async fn mark_request(
        &mut self,
        id: RequestId,
        expected: RequestStatus,
        next: RequestStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if !expected.can_transition_to(next) {
            return Err(BankError::InvalidTransition {
                from: expected,
                to: next,
            });
        }

        let result = sqlx::query(
            "UPDATE transfer_requests SET status = $3, responded_at = $4 \
             WHERE id = $1 AND status = $2",
        )
        .bind(id.value())
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(at)
        .execute(self.conn()?)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM transfer_requests WHERE id = $1")
                    .bind(id.value())
                    .fetch_optional(self.conn()?)
                    .await
                    .map_err(storage_error)?;
            return match status {
                Some(status) => Err(BankError::AlreadyProcessed {
                    id,
                    status: status.parse()?,
                }),
                None => Err(BankError::RequestNotFound(id)),
            };
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| BankError::Internal("unit already finished".to_string()))?;
        tx.commit().await.map_err(storage_error)
    }

    async fn rollback(&mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => tx.rollback().await.map_err(storage_error),
            None => Ok(()),
        }
    }
}

impl Drop for PgUnit {
    fn drop(&mut self) {
        if self.tx.is_some() {
            // sqlx queues the rollback on the connection when it is returned.
            warn!("Unit dropped without commit or rollback");
        }
    }
}
