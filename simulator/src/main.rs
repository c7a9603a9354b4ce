//! Bankcore Simulator
//!
//! Drives concurrent transfers and transfer requests against an in-memory
//! ledger with an unreliable risk service, then checks the ledger invariants.

use clap::Parser;
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod bank;
mod controller;
mod metrics;
mod scenario;
mod scorer;

use controller::SimulationController;
use scenario::Scenario;

/// Bankcore Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Bankcore concurrency and degraded-risk simulation")]
struct Args {
    /// Number of simulated customers
    #[arg(short, long, default_value = "10")]
    users: usize,

    /// Total operations to run
    #[arg(short, long, default_value = "1000")]
    operations: usize,

    /// Concurrent workers
    #[arg(short, long, default_value = "8")]
    concurrency: usize,

    /// Scenario to run: steady, contention or degraded-risk
    #[arg(short, long, default_value = "steady")]
    scenario: String,

    /// Opening balance of every account
    #[arg(long, default_value = "1000")]
    opening_balance: Decimal,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Print engine metrics in Prometheus text format instead of JSON
    #[arg(long)]
    prometheus: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let scenario = Scenario::load(&args.scenario)?;

    info!("Starting Bankcore Simulator");
    info!("Users: {}", args.users);
    info!("Operations: {} on {} workers", args.operations, args.concurrency);

    let mut controller = SimulationController::new(
        args.users,
        args.operations,
        args.concurrency,
        args.seed,
        scenario,
    );
    controller.initialize(args.opening_balance).await?;
    controller.run().await?;

    let verification = controller.verify().await?;
    let metrics = controller.get_metrics().await;

    info!("Simulation complete, ledger invariants hold");
    info!("Total operations: {}", metrics.total_operations);
    info!("Transfers committed: {}", metrics.transfers_committed);
    info!(
        "Requests created/accepted/rejected: {}/{}/{}",
        metrics.requests_created, metrics.requests_accepted, metrics.requests_rejected
    );
    info!(
        "Refused: {} insufficient funds, {} blocked, {} other",
        metrics.insufficient_funds, metrics.blocked, metrics.errors
    );
    info!("Success rate: {:.1}%", metrics.success_rate() * 100.0);
    info!(
        "Latency: avg {}ms, p99 {}ms",
        metrics.average_latency_ms(),
        metrics.p99_latency_ms()
    );
    info!(
        "Ledger: {} rows, {} held of {} deposited",
        verification.ledger_rows, verification.total_balance, verification.deposited
    );
    info!(
        "Locks: {} acquired, {} contended, {} timed out",
        verification.locks.acquired, verification.locks.contended, verification.locks.timed_out
    );

    if args.prometheus {
        print!("{}", verification.prometheus);
    } else {
        println!("{}", serde_json::to_string_pretty(&verification.engine)?);
    }

    Ok(())
}
