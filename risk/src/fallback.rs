//! Local verdict used when the scorer is unavailable.

use bankcore_common::{CandidateTransaction, HistoryEntry, RiskAssessment};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const REASON_ABOVE_USUAL: &str = "Amount significantly higher than usual";
pub const REASON_VERY_LARGE: &str = "Very large transaction amount";
pub const REASON_NORMAL: &str = "Normal transaction";

/// Deterministic amount-based heuristic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackPolicy {
    /// Flag when the amount exceeds this multiple of the history mean.
    pub mean_multiplier: Decimal,
    /// Flag any amount above this.
    pub large_amount: Decimal,
    /// Score for a flagged transfer.
    pub flagged_score: f64,
    /// Score for everything else.
    pub normal_score: f64,
    pub confidence: f64,
    /// Scores above this are fraud.
    pub fraud_threshold: f64,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            mean_multiplier: Decimal::from(3),
            large_amount: Decimal::from(5000),
            flagged_score: 0.7,
            normal_score: 0.2,
            confidence: 0.5,
            fraud_threshold: 0.8,
        }
    }
}

impl FallbackPolicy {
    /// Produce a verdict from the amount and history alone.
    pub fn assess(&self, candidate: &CandidateTransaction, history: &[HistoryEntry]) -> RiskAssessment {
        let amount = candidate.amount.value();
        let mean = mean_amount(history);

        let above_usual = mean > Decimal::ZERO && amount > mean * self.mean_multiplier;
        let very_large = amount > self.large_amount;

        let (risk_score, reason) = if above_usual {
            (self.flagged_score, REASON_ABOVE_USUAL)
        } else if very_large {
            (self.flagged_score, REASON_VERY_LARGE)
        } else {
            (self.normal_score, REASON_NORMAL)
        };

        RiskAssessment {
            risk_score,
            is_fraud: risk_score > self.fraud_threshold,
            reason: reason.to_string(),
            confidence: self.confidence,
            fallback: true,
            features: None,
        }
    }
}

/// Arithmetic mean of history amounts; zero for no history.
pub fn mean_amount(history: &[HistoryEntry]) -> Decimal {
    if history.is_empty() {
        return Decimal::ZERO;
    }
    let total: Decimal = history.iter().map(|h| h.amount).sum();
    total / Decimal::from(history.len())
}
