//! In-process rule-based scorer.

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;

use crate::error::RiskResult;
use crate::scorer::RiskScorer;
use crate::wire::{RiskRequest, RiskResponse};

/// Weights and thresholds for [`RuleScorer`].
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub zscore_threshold: f64,
    pub zscore_weight: f64,
    pub mean_ratio_threshold: f64,
    pub mean_ratio_weight: f64,
    /// Recent rows considered for frequency.
    pub frequency_window: usize,
    pub frequency_threshold: usize,
    pub frequency_weight: f64,
    pub rapid_repeat_hours: f64,
    pub rapid_repeat_weight: f64,
    /// Hours (UTC) before this count as unusual.
    pub quiet_hours_end: u32,
    pub quiet_hours_weight: f64,
    pub large_amount: f64,
    pub large_amount_weight: f64,
    pub first_large_amount: f64,
    pub first_large_weight: f64,
    pub fraud_threshold: f64,
    pub confidence: f64,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            zscore_threshold: 3.0,
            zscore_weight: 0.3,
            mean_ratio_threshold: 5.0,
            mean_ratio_weight: 0.25,
            frequency_window: 20,
            frequency_threshold: 10,
            frequency_weight: 0.2,
            rapid_repeat_hours: 0.5,
            rapid_repeat_weight: 0.15,
            quiet_hours_end: 5,
            quiet_hours_weight: 0.1,
            large_amount: 5000.0,
            large_amount_weight: 0.2,
            first_large_amount: 1000.0,
            first_large_weight: 0.3,
            fraud_threshold: 0.8,
            confidence: 0.7,
        }
    }
}

/// Features derived from one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Features {
    pub amount: f64,
    pub hour: u32,
    pub mean_amount: f64,
    pub amount_zscore: f64,
    pub amount_vs_mean: f64,
    pub recent_tx_count: usize,
    /// Hours since the newest history row, capped at one week.
    pub hours_since_last: Option<f64>,
}

impl Features {
    pub fn extract(request: &RiskRequest, rules: &RuleSet) -> Self {
        let amount = request.transaction.amount.to_f64().unwrap_or(0.0);
        let at: DateTime<Utc> = request.transaction.created_at;
        let amounts: Vec<f64> = request
            .user_history
            .iter()
            .map(|h| h.amount.to_f64().unwrap_or(0.0))
            .collect();

        let (mean, std_dev) = mean_and_std(&amounts);
        let amount_zscore = if std_dev > 0.0 {
            (amount - mean) / std_dev
        } else {
            0.0
        };
        let amount_vs_mean = if mean > 0.0 { amount / mean } else { 1.0 };

        // History arrives newest first.
        let hours_since_last = request.user_history.first().map(|last| {
            let seconds = (at - last.created_at).num_seconds().max(0) as f64;
            (seconds / 3600.0).min(168.0)
        });

        Self {
            amount,
            hour: at.hour(),
            mean_amount: mean,
            amount_zscore,
            amount_vs_mean,
            recent_tx_count: amounts.len().min(rules.frequency_window),
            hours_since_last,
        }
    }
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Scorer that applies [`RuleSet`] in process.
#[derive(Debug, Clone, Default)]
pub struct RuleScorer {
    rules: RuleSet,
}

impl RuleScorer {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    /// Score and explain. Reasons are in rule order.
    pub fn evaluate(&self, features: &Features) -> (f64, Vec<&'static str>) {
        let r = &self.rules;
        let mut score = 0.0;
        let mut reasons = Vec::new();

        let mut apply = |hit: bool, weight: f64, reason: &'static str| {
            if hit {
                score += weight;
                reasons.push(reason);
            }
        };

        apply(
            features.amount_zscore > r.zscore_threshold,
            r.zscore_weight,
            "Amount is significantly higher than usual",
        );
        apply(
            features.amount_vs_mean > r.mean_ratio_threshold,
            r.mean_ratio_weight,
            "Amount is 5x higher than average",
        );
        apply(
            features.recent_tx_count > r.frequency_threshold,
            r.frequency_weight,
            "High transaction frequency detected",
        );
        apply(
            features
                .hours_since_last
                .map_or(false, |hours| hours < r.rapid_repeat_hours),
            r.rapid_repeat_weight,
            "Multiple transactions in very short time",
        );
        apply(
            features.hour < r.quiet_hours_end,
            r.quiet_hours_weight,
            "Transaction at unusual hour",
        );
        apply(
            features.amount > r.large_amount,
            r.large_amount_weight,
            "Very large transaction amount",
        );
        apply(
            features.recent_tx_count == 0 && features.amount > r.first_large_amount,
            r.first_large_weight,
            "First transaction with large amount",
        );

        (round3(score.min(1.0)), reasons)
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[async_trait]
impl RiskScorer for RuleScorer {
    fn name(&self) -> &str {
        "RULES"
    }

    async fn score(&self, request: &RiskRequest) -> RiskResult<RiskResponse> {
        let features = Features::extract(request, &self.rules);
        let (score, reasons) = self.evaluate(&features);
        let reason = if reasons.is_empty() {
            "Normal transaction pattern".to_string()
        } else {
            reasons.join(" | ")
        };

        let response = RiskResponse::verdict(
            score,
            score > self.rules.fraud_threshold,
            reason,
            self.rules.confidence,
        );
        Ok(match serde_json::to_value(&features) {
            Ok(value) => response.with_features(value),
            Err(_) => response,
        })
    }
}
