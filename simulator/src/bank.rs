//! Simulated bank: an in-memory ledger with seeded customers.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::info;

use bankcore_common::{AccountId, ExternalRef, UserId};
use bankcore_engine::{
    EngineConfig, EngineMetrics, FundingPolicy, TransferEngine, TransferPolicy,
    TransferRequestWorkflow,
};
use bankcore_ledger::{LedgerSnapshot, MemoryStore, NewAccount};
use bankcore_risk::{RiskGate, RiskScorer};

/// A seeded customer.
#[derive(Debug, Clone)]
pub struct Customer {
    pub user: UserId,
    pub accounts: Vec<AccountId>,
    pub refs: Vec<ExternalRef>,
}

/// A simulated bank for testing.
pub struct SimulatedBank {
    pub store: MemoryStore,
    pub engine: Arc<TransferEngine>,
    pub workflow: Arc<TransferRequestWorkflow>,
    pub customers: Vec<Customer>,
    /// Sum of all opening deposits.
    pub deposited: Decimal,
}

impl SimulatedBank {
    /// Build a bank over `scorer` with an empty ledger.
    pub fn new(scorer: Arc<dyn RiskScorer>, config: &EngineConfig, lock_timeout: Duration) -> Self {
        let store = MemoryStore::with_lock_timeout(lock_timeout);
        let engine = Arc::new(TransferEngine::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            RiskGate::new(scorer, config.risk.gate_config()),
            TransferPolicy::from(config),
            Arc::new(EngineMetrics::new()),
        ));
        let workflow = Arc::new(TransferRequestWorkflow::new(
            engine.clone(),
            FundingPolicy::FirstSufficient,
        ));

        Self {
            store,
            engine,
            workflow,
            customers: Vec::new(),
            deposited: Decimal::ZERO,
        }
    }

    /// Open `accounts_per_user` accounts per user and fund each through a
    /// deposit of `opening_balance`.
    pub async fn seed(
        &mut self,
        users: usize,
        accounts_per_user: usize,
        opening_balance: Decimal,
    ) -> anyhow::Result<()> {
        for u in 0..users {
            let user = UserId::new(u as i64 + 1);
            let mut customer = Customer {
                user,
                accounts: Vec::with_capacity(accounts_per_user),
                refs: Vec::with_capacity(accounts_per_user),
            };

            for a in 0..accounts_per_user {
                let reference = format!("SIM-{:04}-{}", u + 1, a + 1);
                let account = self.store.open_account(NewAccount::new(user, reference))?;
                self.engine
                    .deposit(account.id, opening_balance, Some("Opening balance".to_string()))
                    .await?;
                self.deposited += opening_balance;
                customer.accounts.push(account.id);
                customer.refs.push(account.external_ref);
            }

            self.customers.push(customer);
        }

        info!(
            users,
            accounts = users * accounts_per_user,
            deposited = %self.deposited,
            "Bank seeded"
        );
        Ok(())
    }

    pub fn deposit_count(&self) -> usize {
        self.customers.iter().map(|c| c.accounts.len()).sum()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.store.snapshot()
    }
}
