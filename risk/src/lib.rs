//! Bankcore Risk Gate
//!
//! Fraud-risk scoring for transfers.
//!
//! # Features
//!
//! - Timeout-bounded scorer calls
//! - Response validation
//! - Deterministic local fallback when the scorer is degraded
//! - In-process rule scorer and external-process scorer
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use bankcore_risk::{RiskGate, RiskGateConfig, RuleScorer};
//!
//! let gate = RiskGate::new(Arc::new(RuleScorer::default()), RiskGateConfig::default());
//! let verdict = gate.assess(&candidate, &history).await;
//! if verdict.exceeds(0.85) {
//!     // block
//! }
//! ```

pub mod error;
pub mod wire;
pub mod scorer;
pub mod fallback;
pub mod gate;
pub mod rules;
pub mod process;

pub use error::{RiskError, RiskResult};
pub use wire::{RiskRequest, RiskResponse};
pub use scorer::RiskScorer;
pub use fallback::FallbackPolicy;
pub use gate::{RiskGate, RiskGateConfig};
pub use rules::{RuleScorer, RuleSet};
pub use process::CommandScorer;

#[cfg(any(test, feature = "test-utils"))]
pub use scorer::{MockScorer, ScriptedOutcome};
