//! Bankcore Engine
//!
//! The engine is the single writer of account balances. It runs every
//! transfer as one atomic ledger unit, consults the risk gate before any
//! mutation and drives the pull-payment request workflow on top of the same
//! primitive.

pub mod config;
pub mod engine;
pub mod metrics;
pub mod requests;

pub use config::{EngineConfig, HistoryConfig, RiskConfig};
pub use engine::{Destination, PreCheck, TransferEngine, TransferOrder, TransferPolicy, TransferReceipt};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use requests::{AcceptOutcome, FundingPolicy, NewRequestOrder, TransferRequestWorkflow};
