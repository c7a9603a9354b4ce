//! Risk assessment types shared by the risk gate, the engine and alerts.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Amount, ExternalRef};

/// The transfer being scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateTransaction {
    /// Amount to move.
    pub amount: Amount,
    /// Where the funds would go.
    pub destination_ref: ExternalRef,
    /// When the transfer was attempted.
    pub timestamp: DateTime<Utc>,
}

impl CandidateTransaction {
    /// Create a candidate stamped with the current time.
    pub fn new(amount: Amount, destination_ref: ExternalRef) -> Self {
        Self {
            amount,
            destination_ref,
            timestamp: Utc::now(),
        }
    }
}

/// A past ledger movement touching the source account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
    pub description: Option<String>,
}

/// Verdict produced by the risk gate. Always present, even when the external
/// scorer was unavailable (`fallback` is then set).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Estimated fraud likelihood in `[0, 1]`.
    pub risk_score: f64,
    /// Hard fraud verdict from the scorer.
    pub is_fraud: bool,
    /// Human-readable explanation.
    pub reason: String,
    /// Scorer confidence in `[0, 1]`.
    pub confidence: f64,
    /// True when the local heuristic replaced the scorer.
    pub fallback: bool,
    /// Optional scorer diagnostics, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<serde_json::Value>,
}

impl RiskAssessment {
    /// Whether this verdict vetoes a transfer under the given threshold.
    ///
    /// The comparison is strict: a score equal to the threshold passes.
    pub fn exceeds(&self, threshold: f64) -> bool {
        self.is_fraud || self.risk_score > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assessment(score: f64, is_fraud: bool) -> RiskAssessment {
        RiskAssessment {
            risk_score: score,
            is_fraud,
            reason: "test".to_string(),
            confidence: 0.9,
            fallback: false,
            features: None,
        }
    }

    #[test]
    fn test_exceeds_threshold() {
        assert!(!assessment(0.85, false).exceeds(0.85));
        assert!(assessment(0.851, false).exceeds(0.85));
        assert!(assessment(0.1, true).exceeds(0.85));
        assert!(assessment(0.81, false).exceeds(0.8));
    }
}
