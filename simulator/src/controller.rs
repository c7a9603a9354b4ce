//! Simulation controller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, info};

use bankcore_common::{BankError, Result as BankResult};
use bankcore_engine::{Destination, EngineConfig, MetricsSnapshot, NewRequestOrder, TransferOrder};
use bankcore_ledger::LockStats;

use crate::bank::SimulatedBank;
use crate::metrics::{Operation, SimulationMetrics};
use crate::scenario::Scenario;
use crate::scorer::FlakyScorer;

const ACCOUNTS_PER_USER: usize = 2;
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_CLEANUP_INTERVAL: Duration = Duration::from_millis(500);

/// Ledger invariants checked after a run.
#[derive(Debug, Clone)]
pub struct Verification {
    pub total_balance: Decimal,
    pub deposited: Decimal,
    pub ledger_rows: usize,
    pub expected_rows: usize,
    pub engine: MetricsSnapshot,
    /// Engine counters in Prometheus text format.
    pub prometheus: String,
    pub locks: LockStats,
}

/// Controls the simulation.
pub struct SimulationController {
    /// Number of customers.
    users: usize,
    /// Operations to run in total.
    operations: usize,
    /// Concurrent workers.
    concurrency: usize,
    seed: Option<u64>,
    scenario: Scenario,
    bank: Option<Arc<SimulatedBank>>,
    /// Simulation metrics.
    metrics: Arc<RwLock<SimulationMetrics>>,
}

impl SimulationController {
    /// Create a new simulation controller.
    pub fn new(
        users: usize,
        operations: usize,
        concurrency: usize,
        seed: Option<u64>,
        scenario: Scenario,
    ) -> Self {
        Self {
            users,
            operations,
            concurrency: concurrency.max(1),
            seed,
            scenario,
            bank: None,
            metrics: Arc::new(RwLock::new(SimulationMetrics::new())),
        }
    }

    /// Build the bank and fund every account.
    pub async fn initialize(&mut self, opening_balance: Decimal) -> anyhow::Result<()> {
        anyhow::ensure!(self.users >= 2, "at least two users are needed");
        info!(
            "Initializing scenario {} with {} users",
            self.scenario.name, self.users
        );

        let mut config = EngineConfig::default();
        config.risk.timeout = self.scenario.risk_timeout();
        let scorer = Arc::new(FlakyScorer::new(self.scenario.scorer, self.seed));

        let mut bank = SimulatedBank::new(scorer, &config, LOCK_TIMEOUT);
        bank.seed(self.users, ACCOUNTS_PER_USER, opening_balance).await?;
        self.bank = Some(Arc::new(bank));

        Ok(())
    }

    fn bank(&self) -> anyhow::Result<Arc<SimulatedBank>> {
        self.bank
            .clone()
            .ok_or_else(|| anyhow::anyhow!("simulation not initialized"))
    }

    /// Run the scenario to completion.
    pub async fn run(&self) -> anyhow::Result<()> {
        let bank = self.bank()?;
        info!(
            "Running {} operations on {} workers: {}",
            self.operations, self.concurrency, self.scenario.description
        );

        let cleanup = tokio::spawn(
            bank.store
                .lock_manager()
                .run_cleanup_loop(LOCK_CLEANUP_INTERVAL),
        );

        let per_worker = self.operations / self.concurrency;
        let remainder = self.operations % self.concurrency;
        let workers = (0..self.concurrency).map(|i| {
            let rng = match self.seed {
                Some(s) => StdRng::seed_from_u64(s.wrapping_add(i as u64 + 1)),
                None => StdRng::from_entropy(),
            };
            let worker = Worker {
                bank: bank.clone(),
                scenario: self.scenario.clone(),
                metrics: self.metrics.clone(),
                rng,
            };
            let count = per_worker + usize::from(i < remainder);
            tokio::spawn(worker.run(count))
        });

        for joined in futures::future::join_all(workers).await {
            joined?;
        }
        cleanup.abort();

        Ok(())
    }

    /// Check conservation, non-negativity and ledger row accounting.
    pub async fn verify(&self) -> anyhow::Result<Verification> {
        let bank = self.bank()?;
        let snapshot = bank.snapshot();
        let engine = bank.engine.metrics().snapshot();
        let expected_rows = engine.transfers_committed as usize + bank.deposit_count();

        anyhow::ensure!(
            snapshot.total_balance == bank.deposited,
            "balance not conserved: {} in accounts, {} deposited",
            snapshot.total_balance,
            bank.deposited
        );
        anyhow::ensure!(
            snapshot.negative_accounts == 0,
            "{} accounts went negative",
            snapshot.negative_accounts
        );
        anyhow::ensure!(
            snapshot.transaction_count == expected_rows,
            "{} ledger rows, expected {}",
            snapshot.transaction_count,
            expected_rows
        );

        let metrics = self.metrics.read().await;
        anyhow::ensure!(
            metrics.transfers_committed + metrics.requests_accepted == engine.transfers_committed,
            "simulator saw {} commits, engine counted {}",
            metrics.transfers_committed + metrics.requests_accepted,
            engine.transfers_committed
        );

        Ok(Verification {
            total_balance: snapshot.total_balance,
            deposited: bank.deposited,
            ledger_rows: snapshot.transaction_count,
            expected_rows,
            engine,
            prometheus: bank.engine.metrics().to_prometheus(),
            locks: bank.store.lock_stats(),
        })
    }

    /// Get simulation metrics.
    pub async fn get_metrics(&self) -> SimulationMetrics {
        self.metrics.read().await.clone()
    }
}

struct Worker {
    bank: Arc<SimulatedBank>,
    scenario: Scenario,
    metrics: Arc<RwLock<SimulationMetrics>>,
    rng: StdRng,
}

impl Worker {
    async fn run(mut self, operations: usize) {
        for _ in 0..operations {
            if self.rng.gen_bool(self.scenario.transfer_share) {
                self.transfer().await;
            } else {
                self.request().await;
            }
        }
    }

    fn amount(&mut self) -> Decimal {
        Decimal::from(
            self.rng
                .gen_range(self.scenario.min_amount..=self.scenario.max_amount),
        )
    }

    /// Two distinct customer indexes.
    fn pair(&mut self) -> (usize, usize) {
        let n = self.bank.customers.len();
        let from = self.rng.gen_range(0..n);
        let mut to = self.rng.gen_range(0..n);
        while to == from {
            to = self.rng.gen_range(0..n);
        }
        (from, to)
    }

    async fn transfer(&mut self) {
        let (mut from, to) = self.pair();
        let mut slot = self.rng.gen_range(0..ACCOUNTS_PER_USER);
        if let Some(hot) = self.scenario.hot_accounts {
            let pick = self.rng.gen_range(0..hot.max(1));
            from = (pick / ACCOUNTS_PER_USER).min(self.bank.customers.len() - 1);
            slot = pick % ACCOUNTS_PER_USER;
        }
        let to = if to == from { (from + 1) % self.bank.customers.len() } else { to };
        let amount = self.amount();
        let destination_slot = self.rng.gen_range(0..ACCOUNTS_PER_USER);

        let source = &self.bank.customers[from];
        let order = TransferOrder {
            source_account_id: source.accounts[slot],
            destination: Destination::Ref(self.bank.customers[to].refs[destination_slot].clone()),
            amount,
            description: Some("Simulated transfer".to_string()),
            acting_user_id: source.user,
        };

        let started = Instant::now();
        let result = self.bank.engine.transfer(order).await;
        self.record(Operation::Transfer, started, result).await;
    }

    async fn request(&mut self) {
        let (requester, payer) = self.pair();
        let amount = self.amount();
        let requester = &self.bank.customers[requester];
        let payer = self.bank.customers[payer].user;
        let order = NewRequestOrder {
            requester: requester.user,
            payer,
            requester_account: requester.accounts[0],
            payer_account: None,
            amount,
            description: None,
        };

        let started = Instant::now();
        let created = self.bank.workflow.create(order).await;
        let request = match &created {
            Ok(request) => request.id,
            Err(_) => {
                self.record(Operation::RequestCreate, started, created).await;
                return;
            }
        };
        self.record(Operation::RequestCreate, started, created).await;

        let started = Instant::now();
        if self.rng.gen_bool(self.scenario.accept_share) {
            let result = self.bank.workflow.accept(request, payer).await;
            self.record(Operation::RequestAccept, started, result).await;
        } else {
            let result = self.bank.workflow.reject(request, payer).await;
            self.record(Operation::RequestReject, started, result).await;
        }
    }

    async fn record<T>(&self, operation: Operation, started: Instant, result: BankResult<T>) {
        let latency = started.elapsed().as_millis() as u64;
        let mut metrics = self.metrics.write().await;
        match result {
            Ok(_) => metrics.record_success(operation, latency),
            Err(e) => {
                if !matches!(e, BankError::InsufficientFunds { .. }) {
                    debug!(?operation, error = %e, "Operation failed");
                }
                metrics.record_failure(&e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn simulate(scenario: &str) -> (Verification, SimulationMetrics) {
        let scenario = Scenario::load(scenario).unwrap();
        let mut controller = SimulationController::new(6, 200, 8, Some(42), scenario);
        controller.initialize(Decimal::from(1000)).await.unwrap();
        controller.run().await.unwrap();
        let verification = controller.verify().await.unwrap();
        (verification, controller.get_metrics().await)
    }

    #[tokio::test]
    async fn test_steady_preserves_invariants() {
        let (verification, metrics) = simulate("steady").await;
        assert_eq!(verification.total_balance, Decimal::from(12000));
        assert_eq!(verification.ledger_rows, verification.expected_rows);
        assert!(metrics.total_operations >= 200);
    }

    #[tokio::test]
    async fn test_contention_never_overdraws() {
        let (verification, metrics) = simulate("contention").await;
        assert_eq!(verification.total_balance, verification.deposited);
        assert!(metrics.insufficient_funds > 0);
        assert!(verification.locks.acquired > 0);
        assert_eq!(verification.locks.timed_out, 0);
    }

    #[tokio::test]
    async fn test_degraded_risk_keeps_transfers_flowing() {
        let (verification, metrics) = simulate("degraded-risk").await;
        assert!(verification.engine.risk_fallbacks > 0);
        assert!(metrics.transfers_committed > 0);
        assert!(verification
            .prometheus
            .contains(&format!("bankcore_risk_fallbacks {}", verification.engine.risk_fallbacks)));
    }

    #[tokio::test]
    async fn test_run_requires_initialize() {
        let controller =
            SimulationController::new(2, 1, 1, None, Scenario::load("steady").unwrap());
        assert!(controller.run().await.is_err());
    }
}
