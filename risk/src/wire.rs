//! JSON shapes exchanged with a risk scorer.

use bankcore_common::{CandidateTransaction, HistoryEntry, RiskAssessment};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{RiskError, RiskResult};

/// Candidate transfer as the scorer sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTransaction {
    pub amount: Decimal,
    #[serde(rename = "toRib")]
    pub to_rib: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// One history row as the scorer sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireHistoryEntry {
    pub amount: Decimal,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub description: Option<String>,
}

/// Scoring request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskRequest {
    pub transaction: WireTransaction,
    /// Trailing history, newest first.
    #[serde(rename = "userHistory")]
    pub user_history: Vec<WireHistoryEntry>,
}

impl RiskRequest {
    pub fn new(candidate: &CandidateTransaction, history: &[HistoryEntry]) -> Self {
        Self {
            transaction: WireTransaction {
                amount: candidate.amount.value(),
                to_rib: candidate.destination_ref.to_string(),
                created_at: candidate.timestamp,
            },
            user_history: history
                .iter()
                .map(|entry| WireHistoryEntry {
                    amount: entry.amount,
                    created_at: entry.timestamp,
                    description: entry.description.clone(),
                })
                .collect(),
        }
    }
}

/// Scoring response. Fields are lenient on the way in and checked by
/// [`RiskResponse::into_assessment`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskResponse {
    pub success: bool,
    #[serde(default)]
    pub risk_score: Option<f64>,
    #[serde(default)]
    pub is_fraud: Option<bool>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RiskResponse {
    /// A successful verdict.
    pub fn verdict(risk_score: f64, is_fraud: bool, reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            success: true,
            risk_score: Some(risk_score),
            is_fraud: Some(is_fraud),
            reason: reason.into(),
            confidence: Some(confidence),
            features: None,
            error: None,
        }
    }

    /// A scorer-reported failure.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            risk_score: Some(0.5),
            is_fraud: Some(false),
            reason: "Error in analysis".to_string(),
            confidence: None,
            features: None,
            error: Some(error.into()),
        }
    }

    pub fn with_features(mut self, features: serde_json::Value) -> Self {
        self.features = Some(features);
        self
    }

    /// Validate and convert into the engine's verdict type.
    pub fn into_assessment(self) -> RiskResult<RiskAssessment> {
        if !self.success {
            return Err(RiskError::Unsuccessful(
                self.error.unwrap_or_else(|| "no error detail".to_string()),
            ));
        }
        let risk_score = unit_interval("risk_score", self.risk_score)?;
        let confidence = unit_interval("confidence", self.confidence)?;
        let is_fraud = self
            .is_fraud
            .ok_or_else(|| RiskError::Malformed("missing is_fraud".to_string()))?;

        Ok(RiskAssessment {
            risk_score,
            is_fraud,
            reason: self.reason,
            confidence,
            fallback: false,
            features: self.features,
        })
    }
}

fn unit_interval(field: &str, value: Option<f64>) -> RiskResult<f64> {
    match value {
        None => Err(RiskError::Malformed(format!("missing {}", field))),
        Some(v) if !v.is_finite() || !(0.0..=1.0).contains(&v) => {
            Err(RiskError::Malformed(format!("{} out of range: {}", field, v)))
        }
        Some(v) => Ok(v),
    }
}
