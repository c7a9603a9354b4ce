//! Bankcore CLI
//!
//! Runs one engine operation against PostgreSQL and prints the result as JSON.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bankcore_common::{
    AccountId, AlertId, BankError, Currency, ErrorBody, ExternalRef, RequestId, Result, UserId,
};
use bankcore_engine::{
    Destination, EngineConfig, EngineMetrics, FundingPolicy, NewRequestOrder, TransferEngine,
    TransferOrder, TransferPolicy, TransferRequestWorkflow,
};
use bankcore_ledger::{NewAccount, PgStore};
use bankcore_risk::{CommandScorer, RiskGate, RiskScorer, RuleScorer};

const USER_ALERT_LIMIT: usize = 20;
const ALL_ALERT_LIMIT: usize = 100;

/// Bankcore transfer engine CLI
#[derive(Parser, Debug)]
#[command(name = "bankcore")]
#[command(about = "Retail-banking transfer and ledger engine")]
struct Cli {
    /// Acting user id
    #[arg(short, long, global = true)]
    user: Option<i64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply database migrations
    Migrate,
    /// Open a zero-balance account
    OpenAccount {
        owner: i64,
        external_ref: String,
        #[arg(long, default_value = "TND")]
        currency: String,
    },
    /// Show one owned account
    Balance { account: i64 },
    /// List the acting user's accounts
    Accounts,
    /// Recent ledger rows of an owned account
    History {
        account: i64,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Move funds to another account
    Transfer {
        /// Source account id
        from: i64,
        /// Destination routing reference
        to: String,
        amount: Decimal,
        #[arg(long)]
        description: Option<String>,
    },
    /// Score a transfer without moving money
    PreCheck { from: i64, to: String, amount: Decimal },
    /// Credit an account with external funds
    Deposit {
        account: i64,
        amount: Decimal,
        #[arg(long)]
        description: Option<String>,
    },
    /// Pull-payment requests
    #[command(subcommand)]
    Request(RequestCommand),
    /// List fraud alerts
    Alerts {
        /// Alerts of every user instead of the acting user
        #[arg(long)]
        all: bool,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Mark a fraud alert resolved
    ResolveAlert { alert: i64 },
}

#[derive(Subcommand, Debug)]
enum RequestCommand {
    /// Ask another user for money
    Create {
        payer: i64,
        /// Account receiving the funds
        account: i64,
        amount: Decimal,
        #[arg(long)]
        payer_account: Option<i64>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Accept a request as its payer
    Accept { request: i64 },
    /// Reject a request as its payer
    Reject { request: i64 },
    /// Pending requests addressed to the acting user
    Pending,
}

struct App {
    store: Arc<PgStore>,
    engine: Arc<TransferEngine>,
    workflow: TransferRequestWorkflow,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let store = Arc::new(
        PgStore::connect(&config.database)
            .await
            .context("connecting to the ledger database")?,
    );
    let app = build(store, &config);

    match run(&app, cli).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            debug!(metrics = ?app.engine.metrics().snapshot(), "Command finished");
            Ok(())
        }
        Err(e) => {
            println!("{}", serde_json::to_string_pretty(&ErrorBody::from(&e))?);
            std::process::exit(1);
        }
    }
}

fn build(store: Arc<PgStore>, config: &EngineConfig) -> App {
    let scorer: Arc<dyn RiskScorer> = match config
        .risk
        .scorer_command
        .as_deref()
        .and_then(CommandScorer::from_command_line)
    {
        Some(command) => Arc::new(command),
        None => Arc::new(RuleScorer::default()),
    };
    debug!(scorer = scorer.name(), "Risk scorer selected");

    let engine = Arc::new(TransferEngine::new(
        store.clone(),
        store.clone(),
        RiskGate::new(scorer, config.risk.gate_config()),
        TransferPolicy::from(config),
        Arc::new(EngineMetrics::new()),
    ));
    let workflow = TransferRequestWorkflow::new(engine.clone(), FundingPolicy::FirstSufficient);

    App {
        store,
        engine,
        workflow,
    }
}

fn acting_user(user: Option<i64>) -> Result<UserId> {
    user.map(UserId::new).ok_or_else(|| BankError::Validation {
        message: "--user is required for this command".to_string(),
        field: Some("user".to_string()),
    })
}

fn json<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| BankError::Internal(format!("encode output: {}", e)))
}

async fn run(app: &App, cli: Cli) -> Result<Value> {
    let engine = &app.engine;
    match cli.command {
        Command::Migrate => {
            app.store.migrate().await?;
            json(serde_json::json!({ "migrated": true }))
        }
        Command::OpenAccount {
            owner,
            external_ref,
            currency,
        } => {
            let account = NewAccount::new(UserId::new(owner), external_ref)
                .with_currency(Currency::new(currency));
            json(app.store.open_account(account).await?)
        }
        Command::Balance { account } => {
            let user = acting_user(cli.user)?;
            json(engine.account(AccountId::new(account), user).await?)
        }
        Command::Accounts => json(engine.accounts(acting_user(cli.user)?).await?),
        Command::History { account, limit } => {
            let user = acting_user(cli.user)?;
            json(engine.history(AccountId::new(account), user, limit).await?)
        }
        Command::Transfer {
            from,
            to,
            amount,
            description,
        } => {
            let order = TransferOrder {
                source_account_id: AccountId::new(from),
                destination: Destination::Ref(ExternalRef::new(to)),
                amount,
                description,
                acting_user_id: acting_user(cli.user)?,
            };
            json(engine.transfer(order).await?)
        }
        Command::PreCheck { from, to, amount } => {
            let user = acting_user(cli.user)?;
            json(
                engine
                    .pre_check(AccountId::new(from), &ExternalRef::new(to), amount, user)
                    .await?,
            )
        }
        Command::Deposit {
            account,
            amount,
            description,
        } => json(
            engine
                .deposit(AccountId::new(account), amount, description)
                .await?,
        ),
        Command::Request(command) => run_request(app, acting_user(cli.user)?, command).await,
        Command::Alerts { all, limit } => {
            if all {
                json(engine.recent_alerts(limit.unwrap_or(ALL_ALERT_LIMIT)).await?)
            } else {
                let user = acting_user(cli.user)?;
                json(engine.alerts_for(user, limit.unwrap_or(USER_ALERT_LIMIT)).await?)
            }
        }
        Command::ResolveAlert { alert } => json(engine.resolve_alert(AlertId::new(alert)).await?),
    }
}

async fn run_request(app: &App, user: UserId, command: RequestCommand) -> Result<Value> {
    let workflow = &app.workflow;
    match command {
        RequestCommand::Create {
            payer,
            account,
            amount,
            payer_account,
            description,
        } => {
            let order = NewRequestOrder {
                requester: user,
                payer: UserId::new(payer),
                requester_account: AccountId::new(account),
                payer_account: payer_account.map(AccountId::new),
                amount,
                description,
            };
            json(workflow.create(order).await?)
        }
        RequestCommand::Accept { request } => {
            json(workflow.accept(RequestId::new(request), user).await?)
        }
        RequestCommand::Reject { request } => {
            json(workflow.reject(RequestId::new(request), user).await?)
        }
        RequestCommand::Pending => json(workflow.pending_for(user).await?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_transfer() {
        let cli = Cli::parse_from(["bankcore", "--user", "7", "transfer", "3", "RIB-9", "12.50"]);
        assert_eq!(cli.user, Some(7));
        match cli.command {
            Command::Transfer { from, to, amount, .. } => {
                assert_eq!(from, 3);
                assert_eq!(to, "RIB-9");
                assert_eq!(amount, Decimal::new(1250, 2));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_request_subcommand() {
        let cli = Cli::parse_from(["bankcore", "request", "accept", "42", "-u", "2"]);
        assert!(matches!(
            cli.command,
            Command::Request(RequestCommand::Accept { request: 42 })
        ));
    }

    #[test]
    fn test_missing_user_is_validation_error() {
        let err = acting_user(None).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }
}
