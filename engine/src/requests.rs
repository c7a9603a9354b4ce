//! Pull-payment requests.
//!
//! A requester asks a payer for money. The payer accepts, which runs a normal
//! risk-gated transfer into the requester's account, or rejects. Both answers
//! are terminal.

use std::sync::Arc;

use bankcore_common::{
    AccountId, Amount, BankError, NewTransferRequest, RequestId, RequestStatus, Result,
    TransferRequest, UserId,
};
use bankcore_ledger::{Account, LedgerStore};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, instrument};

use crate::engine::{
    abandon, Destination, Execution, TransferEngine, TransferOrder, TransferReceipt,
};

const ACCEPTED_DESCRIPTION: &str = "Transfer request accepted";

/// How the payer's funding account is chosen at accept time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FundingPolicy {
    /// First account, by id, whose balance covers the amount.
    #[default]
    FirstSufficient,
}

impl FundingPolicy {
    /// Pick a funding account from `accounts` (ordered by id).
    pub fn select<'a>(&self, accounts: &'a [Account], amount: Amount) -> Option<&'a Account> {
        match self {
            FundingPolicy::FirstSufficient => accounts
                .iter()
                .find(|account| account.has_sufficient_funds(amount)),
        }
    }
}

/// Input for [`TransferRequestWorkflow::create`].
#[derive(Debug, Clone)]
pub struct NewRequestOrder {
    pub requester: UserId,
    pub payer: UserId,
    /// Requester-owned account receiving the funds.
    pub requester_account: AccountId,
    /// Payer account suggested by the requester.
    pub payer_account: Option<AccountId>,
    pub amount: Decimal,
    pub description: Option<String>,
}

/// Result of accepting a request.
#[derive(Debug, Clone, Serialize)]
pub struct AcceptOutcome {
    pub request: TransferRequest,
    pub receipt: TransferReceipt,
}

/// Transfer request workflow.
pub struct TransferRequestWorkflow {
    engine: Arc<TransferEngine>,
    funding: FundingPolicy,
}

impl TransferRequestWorkflow {
    pub fn new(engine: Arc<TransferEngine>, funding: FundingPolicy) -> Self {
        Self { engine, funding }
    }

    pub fn engine(&self) -> &Arc<TransferEngine> {
        &self.engine
    }

    /// Persist a Pending request. Moves no money.
    #[instrument(skip(self, order), fields(requester = %order.requester, payer = %order.payer))]
    pub async fn create(&self, order: NewRequestOrder) -> Result<TransferRequest> {
        let amount = Amount::new(order.amount)?;
        if order.payer == order.requester {
            return Err(BankError::Validation {
                message: "Cannot request money from yourself".to_string(),
                field: Some("payer".to_string()),
            });
        }

        let store = self.engine.store();
        let account = store
            .account(order.requester_account)
            .await?
            .ok_or(BankError::AccountNotFound(order.requester_account))?;
        account.ensure_owned_by(order.requester, "request funds into")?;

        let request = store
            .insert_request(NewTransferRequest {
                from_user_id: order.requester,
                to_user_id: order.payer,
                from_account_id: account.id,
                to_account_id: order.payer_account,
                amount,
                description: order.description,
            })
            .await?;

        self.engine.metrics().request_created();
        info!(request = %request.id, amount = %request.amount, "Transfer request created");
        Ok(request)
    }

    /// Accept a request as its payer.
    ///
    /// The request lock is held for the whole unit, so concurrent accepts
    /// transfer at most once. On any failure the request stays Pending.
    #[instrument(skip_all, fields(request = %request_id, user = %acting_user))]
    pub async fn accept(&self, request_id: RequestId, acting_user: UserId) -> Result<AcceptOutcome> {
        let mut unit = self.engine.store().begin().await?;
        let mut attempted = false;

        let staged = async {
            let request = unit.lock_request(request_id).await?;
            if !request.is_payer(acting_user) {
                return Err(BankError::forbidden(
                    acting_user,
                    format!("accept request {}", request_id),
                ));
            }
            if request.status != RequestStatus::Pending {
                return Err(BankError::AlreadyProcessed {
                    id: request_id,
                    status: request.status,
                });
            }

            attempted = true;
            self.engine.metrics().transfer_started();
            let accounts = unit.accounts_for_owner(acting_user).await?;
            let funding = self
                .funding
                .select(&accounts, request.amount)
                .ok_or_else(|| BankError::InsufficientFunds {
                    required: request.amount.to_string(),
                    available: accounts
                        .iter()
                        .map(|a| a.balance)
                        .max()
                        .unwrap_or(Decimal::ZERO)
                        .to_string(),
                })?;

            let order = TransferOrder {
                source_account_id: funding.id,
                destination: Destination::Account(request.from_account_id),
                amount: request.amount.value(),
                description: Some(
                    request
                        .description
                        .clone()
                        .unwrap_or_else(|| ACCEPTED_DESCRIPTION.to_string()),
                ),
                acting_user_id: acting_user,
            };
            let execution = self
                .engine
                .execute_transfer(unit.as_mut(), &order, request.amount)
                .await?;

            let responded_at = Utc::now();
            let mut accepted = request;
            if let Execution::Staged(_) = &execution {
                unit.mark_request(
                    request_id,
                    RequestStatus::Pending,
                    RequestStatus::Accepted,
                    responded_at,
                )
                .await?;
                accepted.transition_to(RequestStatus::Accepted, responded_at)?;
            }
            Ok::<_, BankError>((accepted, execution))
        }
        .await;

        let (request, execution) = match staged {
            Ok(staged) => staged,
            Err(e) => {
                abandon(unit.as_mut()).await;
                if attempted {
                    self.engine.metrics().transfer_failed();
                }
                return Err(e);
            }
        };

        let receipt = self.engine.settle(unit, Ok(execution), acting_user).await?;

        self.engine.metrics().request_accepted();
        info!(
            transaction = %receipt.transaction.id,
            from = ?receipt.transaction.from_account_id,
            "Transfer request accepted"
        );
        Ok(AcceptOutcome { request, receipt })
    }

    /// Reject a request as its payer.
    #[instrument(skip_all, fields(request = %request_id, user = %acting_user))]
    pub async fn reject(&self, request_id: RequestId, acting_user: UserId) -> Result<TransferRequest> {
        let store = self.engine.store();
        if let Some(request) = store
            .reject_request(request_id, acting_user, Utc::now())
            .await?
        {
            self.engine.metrics().request_rejected();
            info!("Transfer request rejected");
            return Ok(request);
        }

        // Nothing matched; work out why.
        match store.request(request_id).await? {
            None => Err(BankError::RequestNotFound(request_id)),
            Some(request) if !request.is_payer(acting_user) => Err(BankError::forbidden(
                acting_user,
                format!("reject request {}", request_id),
            )),
            Some(request) => Err(BankError::AlreadyProcessed {
                id: request_id,
                status: request.status,
            }),
        }
    }

    /// Pending requests addressed to `payer`, newest first.
    pub async fn pending_for(&self, payer: UserId) -> Result<Vec<TransferRequest>> {
        self.engine.store().pending_requests_for(payer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::Harness;
    use bankcore_common::ErrorKind;
    use bankcore_ledger::FailPoint;
    use bankcore_risk::MockScorer;
    use rust_decimal_macros::dec;

    struct Fixture {
        h: Harness,
        workflow: Arc<TransferRequestWorkflow>,
        requester_account: Account,
    }

    async fn fixture(scorer: MockScorer) -> Fixture {
        let h = Harness::new(scorer);
        let requester_account = h.account(1, "REQ-1", dec!(0)).await;
        let workflow = Arc::new(TransferRequestWorkflow::new(
            h.engine.clone(),
            FundingPolicy::FirstSufficient,
        ));
        Fixture {
            h,
            workflow,
            requester_account,
        }
    }

    impl Fixture {
        async fn request(&self, amount: Decimal) -> TransferRequest {
            self.workflow
                .create(NewRequestOrder {
                    requester: UserId::new(1),
                    payer: UserId::new(2),
                    requester_account: self.requester_account.id,
                    payer_account: None,
                    amount,
                    description: None,
                })
                .await
                .unwrap()
        }

        async fn status(&self, id: RequestId) -> RequestStatus {
            self.h.store.request(id).await.unwrap().unwrap().status
        }
    }

    #[tokio::test]
    async fn test_accept_funds_from_first_sufficient_account() {
        let f = fixture(MockScorer::clean()).await;
        let small = f.h.account(2, "PAY-1", dec!(10)).await;
        let large = f.h.account(2, "PAY-2", dec!(500)).await;
        let request = f.request(dec!(120)).await;
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(f.h.balance(f.requester_account.id).await, dec!(0));

        let outcome = f.workflow.accept(request.id, UserId::new(2)).await.unwrap();

        assert_eq!(outcome.request.status, RequestStatus::Accepted);
        assert!(outcome.request.responded_at.is_some());
        assert_eq!(outcome.receipt.transaction.from_account_id, Some(large.id));
        assert_eq!(
            outcome.receipt.transaction.description.as_deref(),
            Some(ACCEPTED_DESCRIPTION)
        );
        assert_eq!(f.h.balance(small.id).await, dec!(10));
        assert_eq!(f.h.balance(large.id).await, dec!(380));
        assert_eq!(f.h.balance(f.requester_account.id).await, dec!(120));
        assert_eq!(f.status(request.id).await, RequestStatus::Accepted);
    }

    #[tokio::test]
    async fn test_accept_without_funds_stays_pending() {
        let f = fixture(MockScorer::clean()).await;
        let payer = f.h.account(2, "PAY-1", dec!(300)).await;
        let request = f.request(dec!(500)).await;

        let err = f.workflow.accept(request.id, UserId::new(2)).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
        assert_eq!(f.status(request.id).await, RequestStatus::Pending);
        assert_eq!(f.h.balance(payer.id).await, dec!(300));
        assert_eq!(f.h.balance(f.requester_account.id).await, dec!(0));
        assert_eq!(f.h.store.snapshot().transaction_count, 1);

        let metrics = f.h.engine.metrics().snapshot();
        assert_eq!(metrics.transfers_attempted, 1);
        assert_eq!(metrics.transfers_failed, 1);
        assert_eq!(metrics.transfers_active, 0);
    }

    #[tokio::test]
    async fn test_accept_failures_are_counted_like_transfers() {
        let f = fixture(MockScorer::clean()).await;
        let payer = f.h.account(2, "PAY-1", dec!(1000)).await;
        let request = f.request(dec!(100)).await;

        f.h.store.fail_next(FailPoint::Credit);
        let err = f.workflow.accept(request.id, UserId::new(2)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerError);
        assert_eq!(f.h.balance(payer.id).await, dec!(1000));

        f.workflow.accept(request.id, UserId::new(2)).await.unwrap();

        let metrics = f.h.engine.metrics().snapshot();
        assert_eq!(metrics.transfers_attempted, 2);
        assert_eq!(metrics.transfers_failed, 1);
        assert_eq!(metrics.transfers_committed, 1);
        assert_eq!(metrics.transfers_active, 0);
    }

    #[tokio::test]
    async fn test_accept_blocked_by_risk_stays_pending() {
        let f = fixture(MockScorer::fraudulent(0.97)).await;
        let payer = f.h.account(2, "PAY-1", dec!(1000)).await;
        let request = f.request(dec!(100)).await;

        let err = f.workflow.accept(request.id, UserId::new(2)).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Blocked);
        assert_eq!(f.status(request.id).await, RequestStatus::Pending);
        assert_eq!(f.h.balance(payer.id).await, dec!(1000));
        let alerts = f.h.engine.alerts_for(UserId::new(2), 20).await.unwrap();
        assert_eq!(alerts.len(), 1);
    }

    #[tokio::test]
    async fn test_accept_rolls_back_on_commit_failure() {
        let f = fixture(MockScorer::clean()).await;
        let payer = f.h.account(2, "PAY-1", dec!(1000)).await;
        let request = f.request(dec!(100)).await;

        f.h.store.fail_next(FailPoint::Commit);
        assert!(f.workflow.accept(request.id, UserId::new(2)).await.is_err());
        assert_eq!(f.status(request.id).await, RequestStatus::Pending);
        assert_eq!(f.h.balance(payer.id).await, dec!(1000));

        assert!(f.workflow.accept(request.id, UserId::new(2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_only_payer_may_answer() {
        let f = fixture(MockScorer::clean()).await;
        let payer = f.h.account(2, "PAY-1", dec!(1000)).await;
        let request = f.request(dec!(500)).await;

        for user in [UserId::new(1), UserId::new(3)] {
            let err = f.workflow.accept(request.id, user).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Forbidden);
            let err = f.workflow.reject(request.id, user).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Forbidden);
        }
        assert_eq!(f.status(request.id).await, RequestStatus::Pending);
        assert_eq!(f.h.balance(payer.id).await, dec!(1000));
        assert_eq!(f.h.engine.metrics().snapshot().transfers_attempted, 0);
    }

    #[tokio::test]
    async fn test_reject_is_idempotent_terminal() {
        let f = fixture(MockScorer::clean()).await;
        let request = f.request(dec!(100)).await;

        let rejected = f.workflow.reject(request.id, UserId::new(2)).await.unwrap();
        assert_eq!(rejected.status, RequestStatus::Rejected);
        assert!(rejected.responded_at.is_some());

        let err = f.workflow.reject(request.id, UserId::new(2)).await.unwrap_err();
        assert!(matches!(
            err,
            BankError::AlreadyProcessed {
                status: RequestStatus::Rejected,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_answers_are_mutually_exclusive() {
        let f = fixture(MockScorer::clean()).await;
        f.h.account(2, "PAY-1", dec!(1000)).await;

        let accepted = f.request(dec!(10)).await;
        f.workflow.accept(accepted.id, UserId::new(2)).await.unwrap();
        let err = f.workflow.reject(accepted.id, UserId::new(2)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyProcessed);
        assert_eq!(f.status(accepted.id).await, RequestStatus::Accepted);

        let rejected = f.request(dec!(10)).await;
        f.workflow.reject(rejected.id, UserId::new(2)).await.unwrap();
        let err = f.workflow.accept(rejected.id, UserId::new(2)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyProcessed);
        assert_eq!(f.status(rejected.id).await, RequestStatus::Rejected);
    }

    #[tokio::test]
    async fn test_unknown_request() {
        let f = fixture(MockScorer::clean()).await;
        let missing = RequestId::new(999);

        let err = f.workflow.accept(missing, UserId::new(2)).await.unwrap_err();
        assert!(matches!(err, BankError::RequestNotFound(_)));
        let err = f.workflow.reject(missing, UserId::new(2)).await.unwrap_err();
        assert!(matches!(err, BankError::RequestNotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_accepts_transfer_once() {
        let f = fixture(MockScorer::clean()).await;
        let payer = f.h.account(2, "PAY-1", dec!(1000)).await;
        let request = f.request(dec!(100)).await;

        let attempts = (0..8).map(|_| {
            let workflow = f.workflow.clone();
            tokio::spawn(async move { workflow.accept(request.id, UserId::new(2)).await })
        });
        let results = futures::future::join_all(attempts).await;

        let accepted = results.iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
        assert_eq!(accepted, 1);
        assert_eq!(f.h.balance(payer.id).await, dec!(900));
        assert_eq!(f.h.balance(f.requester_account.id).await, dec!(100));
        assert_eq!(f.h.engine.metrics().snapshot().requests_accepted, 1);
    }

    #[tokio::test]
    async fn test_concurrent_accept_and_reject() {
        let f = fixture(MockScorer::clean()).await;
        let payer = f.h.account(2, "PAY-1", dec!(1000)).await;
        let request = f.request(dec!(100)).await;

        let accept = f.workflow.accept(request.id, UserId::new(2));
        let reject = f.workflow.reject(request.id, UserId::new(2));
        let (accepted, rejected) = tokio::join!(accept, reject);

        assert!(accepted.is_ok() != rejected.is_ok());
        let expected = if accepted.is_ok() { dec!(900) } else { dec!(1000) };
        assert_eq!(f.h.balance(payer.id).await, expected);
    }

    #[tokio::test]
    async fn test_create_validation() {
        let f = fixture(MockScorer::clean()).await;
        let base = NewRequestOrder {
            requester: UserId::new(1),
            payer: UserId::new(2),
            requester_account: f.requester_account.id,
            payer_account: None,
            amount: dec!(10),
            description: None,
        };

        let err = f
            .workflow
            .create(NewRequestOrder {
                amount: dec!(0),
                ..base.clone()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = f
            .workflow
            .create(NewRequestOrder {
                payer: UserId::new(1),
                ..base.clone()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = f
            .workflow
            .create(NewRequestOrder {
                requester: UserId::new(3),
                payer: UserId::new(4),
                ..base.clone()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let err = f
            .workflow
            .create(NewRequestOrder {
                requester_account: AccountId::new(404),
                ..base
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_pending_for_lists_open_requests() {
        let f = fixture(MockScorer::clean()).await;
        let first = f.request(dec!(10)).await;
        let second = f.request(dec!(20)).await;
        f.workflow.reject(first.id, UserId::new(2)).await.unwrap();

        let pending = f.workflow.pending_for(UserId::new(2)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.id);
        assert!(f.workflow.pending_for(UserId::new(1)).await.unwrap().is_empty());
    }

    #[test]
    fn test_first_sufficient_respects_order() {
        let now = Utc::now();
        let account = |id: i64, balance: Decimal| Account {
            id: AccountId::new(id),
            owner_id: UserId::new(2),
            balance,
            currency: bankcore_common::Currency::tnd(),
            external_ref: format!("X-{}", id).into(),
            created_at: now,
            updated_at: now,
        };
        let accounts = vec![account(1, dec!(5)), account(2, dec!(50)), account(3, dec!(500))];
        let amount = Amount::new(dec!(40)).unwrap();

        let chosen = FundingPolicy::FirstSufficient.select(&accounts, amount).unwrap();
        assert_eq!(chosen.id, AccountId::new(2));
        assert!(FundingPolicy::FirstSufficient
            .select(&accounts, Amount::new(dec!(501)).unwrap())
            .is_none());
    }
}
