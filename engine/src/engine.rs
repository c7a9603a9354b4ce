//! The transfer engine.
//!
//! Every balance mutation goes through here. A transfer runs inside one
//! [`LedgerUnit`]: source and destination are locked in id order, the source
//! is checked and scored by the risk gate, and only then debited. Anything that goes wrong before commit rolls
//! the whole unit back.

use std::sync::Arc;

use bankcore_common::{
    AccountId, AlertId, AlertStatus, Amount, BankError, CandidateTransaction, ExternalRef,
    FraudAlert, HistoryEntry, NewFraudAlert, Result, RiskAssessment, RiskBlock, UserId,
    window_start,
};
use bankcore_ledger::{Account, AlertSink, LedgerStore, LedgerUnit, NewTransaction, Transaction};
use bankcore_risk::RiskGate;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{EngineConfig, HistoryConfig};
use crate::metrics::EngineMetrics;

/// Verdict thresholds and history sizing used by the engine.
#[derive(Debug, Clone)]
pub struct TransferPolicy {
    /// Scores strictly above this block a transfer.
    pub block_threshold: f64,
    /// Scores strictly above this raise an advisory alert on pre-check.
    pub advisory_threshold: f64,
    pub history: HistoryConfig,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for TransferPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            block_threshold: config.risk.block_threshold,
            advisory_threshold: config.risk.advisory_threshold,
            history: config.history.clone(),
        }
    }
}

/// Where a transfer sends funds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Routing reference, as typed by a user.
    Ref(ExternalRef),
    /// Known account, as used by request acceptance.
    Account(AccountId),
}

/// A direct transfer order.
#[derive(Debug, Clone)]
pub struct TransferOrder {
    pub source_account_id: AccountId,
    pub destination: Destination,
    /// Unvalidated; must be strictly positive.
    pub amount: Decimal,
    pub description: Option<String>,
    pub acting_user_id: UserId,
}

/// Result of a committed transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferReceipt {
    /// The ledger row written.
    pub transaction: Transaction,
    /// Source balance after the debit.
    pub source_balance: Decimal,
    /// Verdict the transfer was admitted under.
    pub risk: RiskAssessment,
}

/// Advisory verdict returned by [`TransferEngine::pre_check`].
#[derive(Debug, Clone, Serialize)]
pub struct PreCheck {
    #[serde(flatten)]
    pub assessment: RiskAssessment,
    pub allow_transaction: bool,
    /// Alert raised for an elevated score.
    pub alert_id: Option<AlertId>,
}

/// Outcome of [`TransferEngine::execute_transfer`] inside an open unit.
#[derive(Debug)]
pub(crate) enum Execution {
    /// Writes staged in the unit; the caller commits.
    Staged(TransferReceipt),
    /// Vetoed by the risk gate; the caller rolls back and reports.
    Blocked {
        candidate: CandidateTransaction,
        assessment: RiskAssessment,
    },
}

/// The transfer engine.
pub struct TransferEngine {
    store: Arc<dyn LedgerStore>,
    alerts: Arc<dyn AlertSink>,
    gate: RiskGate,
    policy: TransferPolicy,
    metrics: Arc<EngineMetrics>,
}

impl TransferEngine {
    /// Create a new engine over the given storage and gate.
    pub fn new(
        store: Arc<dyn LedgerStore>,
        alerts: Arc<dyn AlertSink>,
        gate: RiskGate,
        policy: TransferPolicy,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            store,
            alerts,
            gate,
            policy,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn policy(&self) -> &TransferPolicy {
        &self.policy
    }

    /// Move funds from an owned account to another account.
    #[instrument(
        skip(self, order),
        fields(
            source = %order.source_account_id,
            amount = %order.amount,
            user = %order.acting_user_id
        )
    )]
    pub async fn transfer(&self, order: TransferOrder) -> Result<TransferReceipt> {
        let amount = Amount::new(order.amount)?;
        self.metrics.transfer_started();

        let mut unit = match self.store.begin().await {
            Ok(unit) => unit,
            Err(e) => {
                self.metrics.transfer_failed();
                return Err(e);
            }
        };

        let execution = self.execute_transfer(unit.as_mut(), &order, amount).await;
        let receipt = self.settle(unit, execution, order.acting_user_id).await?;

        info!(
            transaction = %receipt.transaction.id,
            to = %receipt.transaction.to_account_id,
            fallback = receipt.risk.fallback,
            "Transfer committed"
        );
        Ok(receipt)
    }

    /// Commit a staged transfer, or roll back and report why not.
    ///
    /// Shared by direct transfers and request acceptance.
    pub(crate) async fn settle(
        &self,
        mut unit: Box<dyn LedgerUnit>,
        execution: Result<Execution>,
        acting_user_id: UserId,
    ) -> Result<TransferReceipt> {
        match execution {
            Ok(Execution::Staged(receipt)) => match unit.commit().await {
                Ok(()) => {
                    self.metrics.transfer_committed();
                    Ok(receipt)
                }
                Err(e) => {
                    abandon(unit.as_mut()).await;
                    self.metrics.transfer_failed();
                    Err(e)
                }
            },
            Ok(Execution::Blocked {
                candidate,
                assessment,
            }) => {
                abandon(unit.as_mut()).await;
                drop(unit);
                self.metrics.transfer_blocked();

                let alert_id = self
                    .raise_alert(acting_user_id, candidate, &assessment, AlertStatus::Blocked)
                    .await;
                warn!(
                    risk_score = assessment.risk_score,
                    is_fraud = assessment.is_fraud,
                    reason = %assessment.reason,
                    "Transfer blocked by risk gate"
                );
                Err(BankError::RiskBlocked(Box::new(RiskBlock {
                    assessment,
                    threshold: self.policy.block_threshold,
                    alert_id,
                })))
            }
            Err(e) => {
                abandon(unit.as_mut()).await;
                self.metrics.transfer_failed();
                debug!(error = %e, "Transfer rolled back");
                Err(e)
            }
        }
    }

    /// Stage a transfer inside `unit` without committing it.
    ///
    /// Source and destination are locked together in id order before any
    /// check, so opposing transfers between the same pair serialize instead
    /// of deadlocking.
    pub(crate) async fn execute_transfer(
        &self,
        unit: &mut dyn LedgerUnit,
        order: &TransferOrder,
        amount: Amount,
    ) -> Result<Execution> {
        let destination_id = match &order.destination {
            Destination::Ref(reference) => {
                match unit.find_by_external_ref(&validated_ref(reference)?).await {
                    Ok(account) => Some(account.id),
                    Err(BankError::DestinationNotFound(_)) => None,
                    Err(e) => return Err(e),
                }
            }
            Destination::Account(id) => Some(*id),
        };

        let mut ids = vec![order.source_account_id];
        ids.extend(destination_id);
        let locked = unit.lock_accounts(&ids).await?;
        let locked_account = |id: AccountId| locked.iter().find(|a| a.id == id).cloned();

        let source = locked_account(order.source_account_id)
            .ok_or(BankError::AccountNotFound(order.source_account_id))?;
        source.ensure_owned_by(order.acting_user_id, "debit")?;
        source.ensure_funds(amount)?;

        let history = unit
            .recent_history(
                source.id,
                window_start(self.policy.history.window),
                self.policy.history.limit,
            )
            .await?;

        let destination = destination_id.and_then(locked_account);
        let destination_ref = match (&order.destination, &destination) {
            (Destination::Ref(reference), _) => validated_ref(reference)?,
            (Destination::Account(_), Some(account)) => account.external_ref.clone(),
            (Destination::Account(id), None) => return Err(BankError::AccountNotFound(*id)),
        };
        let candidate = CandidateTransaction::new(amount, destination_ref.clone());

        let assessment = self.score(&candidate, &history).await;
        if assessment.exceeds(self.policy.block_threshold) {
            return Ok(Execution::Blocked {
                candidate,
                assessment,
            });
        }

        let destination =
            destination.ok_or_else(|| BankError::DestinationNotFound(destination_ref.to_string()))?;
        check_destination(&source, &destination)?;

        let source_balance = unit.debit(source.id, amount).await?;
        unit.credit(destination.id, amount).await?;
        let transaction = unit
            .append_ledger_row(NewTransaction::transfer(
                source.id,
                destination.id,
                amount,
                order.description.clone(),
            ))
            .await?;

        Ok(Execution::Staged(TransferReceipt {
            transaction,
            source_balance,
            risk: assessment,
        }))
    }

    /// Score a transfer without moving money.
    #[instrument(skip_all, fields(source = %source_account_id, amount = %amount))]
    pub async fn pre_check(
        &self,
        source_account_id: AccountId,
        destination_ref: &ExternalRef,
        amount: Decimal,
        acting_user_id: UserId,
    ) -> Result<PreCheck> {
        let amount = Amount::new(amount)?;
        let destination_ref = validated_ref(destination_ref)?;
        let source = self.account_or_not_found(source_account_id).await?;
        source.ensure_owned_by(acting_user_id, "check transfers from")?;

        let history = self.read_history(source.id).await?;
        let candidate = CandidateTransaction::new(amount, destination_ref);
        let assessment = self.score(&candidate, &history).await;

        let alert_id = if assessment.exceeds(self.policy.advisory_threshold) {
            self.raise_alert(acting_user_id, candidate, &assessment, AlertStatus::Pending)
                .await
        } else {
            None
        };

        Ok(PreCheck {
            allow_transaction: !assessment.is_fraud,
            assessment,
            alert_id,
        })
    }

    /// Credit an account with funds entering from outside the ledger.
    #[instrument(skip_all, fields(account = %account_id, amount = %amount))]
    pub async fn deposit(
        &self,
        account_id: AccountId,
        amount: Decimal,
        description: Option<String>,
    ) -> Result<Transaction> {
        let amount = Amount::new(amount)?;
        let mut unit = self.store.begin().await?;

        let staged = async {
            unit.credit(account_id, amount).await?;
            unit.append_ledger_row(NewTransaction::deposit(account_id, amount, description))
                .await
        }
        .await;

        let transaction = match staged {
            Ok(transaction) => transaction,
            Err(e) => {
                abandon(unit.as_mut()).await;
                return Err(e);
            }
        };
        if let Err(e) = unit.commit().await {
            abandon(unit.as_mut()).await;
            return Err(e);
        }

        self.metrics.deposit_committed();
        info!(transaction = %transaction.id, "Deposit committed");
        Ok(transaction)
    }

    /// Read an owned account.
    pub async fn account(&self, account_id: AccountId, acting_user_id: UserId) -> Result<Account> {
        let account = self.account_or_not_found(account_id).await?;
        account.ensure_owned_by(acting_user_id, "view")?;
        Ok(account)
    }

    /// All accounts of a user, by id.
    pub async fn accounts(&self, acting_user_id: UserId) -> Result<Vec<Account>> {
        self.store.accounts_for_owner(acting_user_id).await
    }

    /// Recent ledger rows of an owned account, newest first.
    pub async fn history(
        &self,
        account_id: AccountId,
        acting_user_id: UserId,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        self.account(account_id, acting_user_id).await?;
        self.store.transactions_for_account(account_id, limit).await
    }

    /// Alerts raised for a user, newest first.
    pub async fn alerts_for(&self, user: UserId, limit: usize) -> Result<Vec<FraudAlert>> {
        self.alerts.alerts_for_user(user, limit).await
    }

    /// Alerts across all users, newest first.
    pub async fn recent_alerts(&self, limit: usize) -> Result<Vec<FraudAlert>> {
        self.alerts.recent_alerts(limit).await
    }

    pub async fn resolve_alert(&self, alert_id: AlertId) -> Result<FraudAlert> {
        let alert = self.alerts.resolve(alert_id).await?;
        info!(alert = %alert.id, "Fraud alert resolved");
        Ok(alert)
    }

    async fn account_or_not_found(&self, id: AccountId) -> Result<Account> {
        self.store
            .account(id)
            .await?
            .ok_or(BankError::AccountNotFound(id))
    }

    async fn read_history(&self, id: AccountId) -> Result<Vec<HistoryEntry>> {
        let mut unit = self.store.begin().await?;
        let history = unit
            .recent_history(
                id,
                window_start(self.policy.history.window),
                self.policy.history.limit,
            )
            .await;
        abandon(unit.as_mut()).await;
        history
    }

    async fn score(
        &self,
        candidate: &CandidateTransaction,
        history: &[HistoryEntry],
    ) -> RiskAssessment {
        let assessment = self.gate.assess(candidate, history).await;
        if assessment.fallback {
            self.metrics.risk_fallback();
        }
        assessment
    }

    /// Persist an alert. Sink failures are logged, never propagated.
    async fn raise_alert(
        &self,
        user_id: UserId,
        transaction: CandidateTransaction,
        assessment: &RiskAssessment,
        status: AlertStatus,
    ) -> Option<AlertId> {
        let alert = NewFraudAlert {
            user_id,
            transaction,
            risk_score: assessment.risk_score,
            reason: assessment.reason.clone(),
            status,
        };
        match self.alerts.record(alert).await {
            Ok(alert) => {
                self.metrics.alert_recorded();
                info!(alert = %alert.id, status = %alert.status, "Fraud alert recorded");
                Some(alert.id)
            }
            Err(e) => {
                self.metrics.alert_dropped();
                error!(error = %e, "Failed to record fraud alert");
                None
            }
        }
    }
}

/// Roll back, logging rather than masking the failure that caused it.
pub(crate) async fn abandon(unit: &mut dyn LedgerUnit) {
    if let Err(e) = unit.rollback().await {
        warn!(error = %e, "Rollback failed");
    }
}

fn validated_ref(reference: &ExternalRef) -> Result<ExternalRef> {
    if !reference.is_valid() {
        return Err(BankError::Validation {
            message: format!("Invalid destination reference '{}'", reference),
            field: Some("destination_ref".to_string()),
        });
    }
    Ok(reference.clone())
}

fn check_destination(source: &Account, destination: &Account) -> Result<()> {
    if destination.id == source.id {
        return Err(BankError::Validation {
            message: "Cannot transfer to the source account".to_string(),
            field: Some("destination_ref".to_string()),
        });
    }
    if destination.currency != source.currency {
        return Err(BankError::CurrencyMismatch {
            expected: source.currency.clone(),
            actual: destination.currency.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bankcore_common::{Currency, ErrorKind};
    use bankcore_ledger::{FailPoint, MemoryStore, NewAccount};
    use bankcore_risk::{MockScorer, RiskGateConfig, RiskResponse, ScriptedOutcome};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    pub(crate) struct Harness {
        pub store: MemoryStore,
        pub scorer: Arc<MockScorer>,
        pub engine: Arc<TransferEngine>,
    }

    impl Harness {
        pub fn new(scorer: MockScorer) -> Self {
            Self::with_timeout(scorer, Duration::from_millis(200))
        }

        pub fn with_timeout(scorer: MockScorer, timeout: Duration) -> Self {
            let store = MemoryStore::with_lock_timeout(Duration::from_secs(5));
            let scorer = Arc::new(scorer);
            let gate = RiskGate::new(
                scorer.clone(),
                RiskGateConfig {
                    timeout,
                    ..Default::default()
                },
            );
            let engine = Arc::new(TransferEngine::new(
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                gate,
                TransferPolicy::default(),
                Arc::new(EngineMetrics::new()),
            ));
            Self {
                store,
                scorer,
                engine,
            }
        }

        pub async fn account(&self, owner: i64, reference: &str, balance: Decimal) -> Account {
            let account = self
                .store
                .open_account(NewAccount::new(UserId::new(owner), reference))
                .unwrap();
            if !balance.is_zero() {
                self.engine
                    .deposit(account.id, balance, Some("opening balance".to_string()))
                    .await
                    .unwrap();
            }
            account
        }

        pub async fn balance(&self, id: AccountId) -> Decimal {
            self.store.account(id).await.unwrap().unwrap().balance
        }
    }

    pub(crate) fn order(source: &Account, reference: &str, amount: Decimal) -> TransferOrder {
        TransferOrder {
            source_account_id: source.id,
            destination: Destination::Ref(ExternalRef::new(reference)),
            amount,
            description: None,
            acting_user_id: source.owner_id,
        }
    }

    #[tokio::test]
    async fn test_simple_transfer() {
        let h = Harness::new(MockScorer::clean());
        let a = h.account(1, "R1", dec!(1000)).await;
        let b = h.account(2, "R2", dec!(200)).await;

        let receipt = tokio_test::assert_ok!(h.engine.transfer(order(&a, "R2", dec!(500))).await);

        assert_eq!(receipt.source_balance, dec!(500));
        assert_eq!(receipt.risk.risk_score, 0.1);
        assert!(!receipt.risk.fallback);
        assert_eq!(h.balance(a.id).await, dec!(500));
        assert_eq!(h.balance(b.id).await, dec!(700));

        let row = &receipt.transaction;
        assert_eq!(row.amount.value(), dec!(500));
        assert_eq!(row.from_account_id, Some(a.id));
        assert_eq!(row.to_account_id, b.id);
        assert_eq!(h.store.snapshot().transaction_count, 3);

        let request = h.scorer.last_request().unwrap();
        assert_eq!(request.transaction.to_rib, "R2");
        assert_eq!(request.user_history.len(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_balances() {
        let h = Harness::new(MockScorer::clean());
        let a = h.account(1, "A-1", dec!(1000)).await;
        let b = h.account(2, "B-1", dec!(0)).await;

        let err = h
            .engine
            .transfer(order(&a, "B-1", dec!(10000)))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
        assert_eq!(h.balance(a.id).await, dec!(1000));
        assert_eq!(h.balance(b.id).await, dec!(0));
        assert_eq!(h.scorer.calls(), 0);
        assert_eq!(h.engine.metrics().snapshot().transfers_failed, 1);
    }

    #[tokio::test]
    async fn test_fraud_block_is_atomic_with_one_alert() {
        let h = Harness::new(MockScorer::fraudulent(0.92));
        let a = h.account(1, "A-1", dec!(10000)).await;
        let b = h.account(2, "B-1", dec!(0)).await;

        let err = h
            .engine
            .transfer(order(&a, "B-1", dec!(9000)))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Blocked);
        let block = err.risk_block().unwrap();
        assert_eq!(block.assessment.risk_score, 0.92);
        assert_eq!(block.threshold, 0.85);

        assert_eq!(h.balance(a.id).await, dec!(10000));
        assert_eq!(h.balance(b.id).await, dec!(0));
        assert_eq!(h.store.snapshot().transaction_count, 1);

        let alerts = h.engine.alerts_for(UserId::new(1), 20).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].status, AlertStatus::Blocked);
        assert_eq!(Some(alerts[0].id), block.alert_id);
        assert_eq!(alerts[0].transaction.amount.value(), dec!(9000));
    }

    #[tokio::test]
    async fn test_threshold_is_strict() {
        let scorer = MockScorer::new(RiskResponse::verdict(0.85, false, "borderline", 0.7));
        let h = Harness::new(scorer);
        let a = h.account(1, "A-1", dec!(100)).await;
        h.account(2, "B-1", dec!(0)).await;

        assert!(h.engine.transfer(order(&a, "B-1", dec!(10))).await.is_ok());

        h.scorer.push(ScriptedOutcome::Respond(RiskResponse::verdict(
            0.851, false, "elevated", 0.7,
        )));
        let err = h
            .engine
            .transfer(order(&a, "B-1", dec!(10)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Blocked);
    }

    #[tokio::test]
    async fn test_unreachable_gate_falls_back() {
        let h = Harness::with_timeout(
            MockScorer::hanging(Duration::from_secs(30)),
            Duration::from_millis(50),
        );
        let a = h.account(1, "A-1", dec!(500)).await;
        h.account(2, "B-1", dec!(0)).await;

        let receipt = h.engine.transfer(order(&a, "B-1", dec!(100))).await.unwrap();

        assert!(receipt.risk.fallback);
        assert_eq!(receipt.risk.risk_score, 0.2);
        assert_eq!(receipt.risk.confidence, 0.5);
        assert_eq!(h.engine.metrics().snapshot().risk_fallbacks, 1);
    }

    #[tokio::test]
    async fn test_timed_out_gate_flags_unusual_amount_but_commits() {
        let h = Harness::with_timeout(
            MockScorer::hanging(Duration::from_secs(30)),
            Duration::from_millis(50),
        );
        let a = h
            .store
            .open_account(NewAccount::new(UserId::new(1), "A-1"))
            .unwrap();
        let b = h.account(2, "B-1", dec!(0)).await;
        for _ in 0..30 {
            h.engine.deposit(a.id, dec!(200), None).await.unwrap();
        }

        let receipt = h.engine.transfer(order(&a, "B-1", dec!(5000))).await.unwrap();

        assert!(receipt.risk.fallback);
        assert_eq!(receipt.risk.risk_score, 0.7);
        assert!(!receipt.risk.is_fraud);
        assert_eq!(receipt.risk.reason, "Amount significantly higher than usual");
        assert_eq!(h.balance(a.id).await, dec!(1000));
        assert_eq!(h.balance(b.id).await, dec!(5000));
        assert!(h.engine.recent_alerts(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deposit_past_balance_range_is_refused() {
        let h = Harness::new(MockScorer::clean());
        let a = h.account(1, "A-1", dec!(9000000000000000)).await;

        let err = h
            .engine
            .deposit(a.id, dec!(9000000000000000), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = h
            .engine
            .deposit(a.id, dec!(50000000000000000000000000000), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        assert_eq!(h.balance(a.id).await, dec!(9000000000000000));
        assert_eq!(h.store.snapshot().transaction_count, 1);
        assert_eq!(h.engine.metrics().snapshot().deposits, 1);
    }

    #[tokio::test]
    async fn test_forbidden_and_not_found() {
        let h = Harness::new(MockScorer::clean());
        let a = h.account(1, "A-1", dec!(100)).await;
        h.account(2, "B-1", dec!(0)).await;

        let mut stolen = order(&a, "B-1", dec!(10));
        stolen.acting_user_id = UserId::new(2);
        let err = h.engine.transfer(stolen).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let mut missing = order(&a, "B-1", dec!(10));
        missing.source_account_id = AccountId::new(404);
        let err = h.engine.transfer(missing).await.unwrap_err();
        assert!(matches!(err, BankError::AccountNotFound(_)));

        let err = h
            .engine
            .transfer(order(&a, "NOWHERE", dec!(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::DestinationNotFound(_)));
        assert_eq!(h.balance(a.id).await, dec!(100));
    }

    #[tokio::test]
    async fn test_validation_happens_before_storage() {
        let h = Harness::new(MockScorer::clean());
        let a = h.account(1, "A-1", dec!(100)).await;

        for amount in [dec!(0), dec!(-5), dec!(0.00001)] {
            let err = h.engine.transfer(order(&a, "A-1", amount)).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        assert_eq!(h.engine.metrics().snapshot().transfers_attempted, 0);

        let err = h
            .engine
            .transfer(order(&a, "A-1", dec!(10)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(h.balance(a.id).await, dec!(100));
    }

    #[tokio::test]
    async fn test_currency_mismatch() {
        let h = Harness::new(MockScorer::clean());
        let a = h.account(1, "A-1", dec!(100)).await;
        h.store
            .open_account(NewAccount::new(UserId::new(2), "EUR-1").with_currency(Currency::eur()))
            .unwrap();

        let err = h
            .engine
            .transfer(order(&a, "EUR-1", dec!(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::CurrencyMismatch { .. }));
        assert_eq!(h.balance(a.id).await, dec!(100));
    }

    #[tokio::test]
    async fn test_storage_failure_after_debit_rolls_back() {
        let h = Harness::new(MockScorer::clean());
        let a = h.account(1, "A-1", dec!(100)).await;
        let b = h.account(2, "B-1", dec!(0)).await;

        for point in [FailPoint::Credit, FailPoint::AppendRow, FailPoint::Commit] {
            h.store.fail_next(point);
            let err = h
                .engine
                .transfer(order(&a, "B-1", dec!(60)))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ServerError);
            assert!(err.is_retryable());
            assert_eq!(h.balance(a.id).await, dec!(100));
            assert_eq!(h.balance(b.id).await, dec!(0));
        }
        assert_eq!(h.store.snapshot().transaction_count, 1);
        assert!(h.engine.transfer(order(&a, "B-1", dec!(60))).await.is_ok());
    }

    #[tokio::test]
    async fn test_alert_sink_failure_still_blocks() {
        let h = Harness::new(MockScorer::fraudulent(0.95));
        let a = h.account(1, "A-1", dec!(100)).await;
        h.account(2, "B-1", dec!(0)).await;
        h.store.fail_next(FailPoint::RecordAlert);

        let err = h
            .engine
            .transfer(order(&a, "B-1", dec!(10)))
            .await
            .unwrap_err();
        assert_eq!(err.risk_block().unwrap().alert_id, None);
        assert_eq!(h.balance(a.id).await, dec!(100));
        assert_eq!(h.engine.metrics().snapshot().alerts_dropped, 1);
    }

    #[tokio::test]
    async fn test_pre_check_raises_advisory_alert() {
        let scorer = MockScorer::new(RiskResponse::verdict(0.82, false, "elevated", 0.7));
        let h = Harness::new(scorer);
        let a = h.account(1, "A-1", dec!(100)).await;

        let check = h
            .engine
            .pre_check(a.id, &ExternalRef::new("B-1"), dec!(50), UserId::new(1))
            .await
            .unwrap();
        assert!(check.allow_transaction);
        assert!(check.alert_id.is_some());

        let alerts = h.engine.alerts_for(UserId::new(1), 20).await.unwrap();
        assert_eq!(alerts[0].status, AlertStatus::Pending);
        assert_eq!(h.balance(a.id).await, dec!(100));

        let err = h
            .engine
            .pre_check(a.id, &ExternalRef::new("B-1"), dec!(50), UserId::new(9))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_pre_check_below_advisory_has_no_alert() {
        let h = Harness::new(MockScorer::clean());
        let a = h.account(1, "A-1", dec!(100)).await;

        let check = h
            .engine
            .pre_check(a.id, &ExternalRef::new("B-1"), dec!(50), UserId::new(1))
            .await
            .unwrap();
        assert!(check.alert_id.is_none());
        assert!(h.engine.recent_alerts(100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_is_ownership_checked() {
        let h = Harness::new(MockScorer::clean());
        let a = h.account(1, "A-1", dec!(100)).await;
        h.account(2, "B-1", dec!(0)).await;
        h.engine.transfer(order(&a, "B-1", dec!(10))).await.unwrap();

        let rows = h.engine.history(a.id, UserId::new(1), 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(!rows[0].is_external_credit());

        let err = h.engine.history(a.id, UserId::new(2), 10).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_concurrent_transfers_never_overdraw() {
        let h = Harness::new(MockScorer::clean());
        let a = h.account(1, "A-1", dec!(100)).await;
        let b = h.account(2, "B-1", dec!(0)).await;

        let attempts = (0..10).map(|_| {
            let engine = h.engine.clone();
            let order = order(&a, "B-1", dec!(30));
            tokio::spawn(async move { engine.transfer(order).await })
        });
        let results = futures::future::join_all(attempts).await;

        let committed = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();
        assert_eq!(committed, 3);
        assert_eq!(h.balance(a.id).await, dec!(10));
        assert_eq!(h.balance(b.id).await, dec!(90));
        assert_eq!(h.store.snapshot().negative_accounts, 0);
    }

    #[tokio::test]
    async fn test_opposing_transfers_do_not_deadlock() {
        let h = Harness::new(MockScorer::clean());
        let a = h.account(1, "A-1", dec!(100)).await;
        let b = h.account(2, "B-1", dec!(100)).await;

        let tasks = (0..20).map(|i| {
            let engine = h.engine.clone();
            let order = if i % 2 == 0 {
                order(&a, "B-1", dec!(7))
            } else {
                order(&b, "A-1", dec!(7))
            };
            tokio::spawn(async move { engine.transfer(order).await })
        });
        let results = tokio::time::timeout(
            Duration::from_secs(10),
            futures::future::join_all(tasks),
        )
        .await
        .unwrap();

        assert!(results.iter().all(|r| matches!(r, Ok(Ok(_)))));
        assert_eq!(h.store.snapshot().total_balance, dec!(200));
        assert_eq!(h.balance(a.id).await, dec!(100));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn transfers_conserve_value(
            seeds in proptest::collection::vec(0u32..500, 3),
            moves in proptest::collection::vec((0usize..3, 0usize..3, 1u32..300), 1..25),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let h = Harness::new(MockScorer::clean());
                let mut accounts = Vec::new();
                for (i, seed) in seeds.iter().enumerate() {
                    let account = h
                        .account(i as i64 + 1, &format!("P-{}", i), Decimal::from(*seed))
                        .await;
                    accounts.push(account);
                }
                let deposited: Decimal = seeds.iter().map(|s| Decimal::from(*s)).sum();

                let mut committed = 0usize;
                for (from, to, amount) in moves {
                    let reference = accounts[to].external_ref.to_string();
                    let result = h
                        .engine
                        .transfer(order(&accounts[from], &reference, Decimal::from(amount)))
                        .await;
                    if result.is_ok() {
                        committed += 1;
                    }
                }

                let snapshot = h.store.snapshot();
                let deposits = seeds.iter().filter(|s| **s > 0).count();
                prop_assert_eq!(snapshot.total_balance, deposited);
                prop_assert_eq!(snapshot.deposit_total, deposited);
                prop_assert_eq!(snapshot.negative_accounts, 0);
                prop_assert_eq!(snapshot.transaction_count, committed + deposits);
                Ok(())
            })?;
        }
    }
}
