//! Simulation scenarios.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the simulated risk service misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScorerProfile {
    /// Chance a call sleeps past the gate timeout.
    pub stall_rate: f64,
    /// Chance a call fails outright.
    pub failure_rate: f64,
    /// Chance a call returns a fraud verdict.
    pub fraud_rate: f64,
    /// Latency of a healthy call, in milliseconds.
    pub latency_ms: u64,
}

impl ScorerProfile {
    pub fn healthy() -> Self {
        Self {
            stall_rate: 0.0,
            failure_rate: 0.0,
            fraud_rate: 0.02,
            latency_ms: 2,
        }
    }
}

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Share of operations that are direct transfers; the rest are requests.
    pub transfer_share: f64,
    /// Chance a created request is accepted rather than rejected.
    pub accept_share: f64,
    /// Transfers only draw from the first `hot_accounts` accounts when set.
    pub hot_accounts: Option<usize>,
    /// Transfer amounts are drawn from this range, in whole units.
    pub min_amount: u64,
    pub max_amount: u64,
    /// Risk gate timeout used for the run.
    pub risk_timeout_ms: u64,
    pub scorer: ScorerProfile,
}

impl Scenario {
    /// Load a scenario by name.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "steady" => Ok(Self::steady()),
            "contention" => Ok(Self::contention()),
            "degraded-risk" => Ok(Self::degraded_risk()),
            _ => Err(anyhow::anyhow!("Unknown scenario: {}", name)),
        }
    }

    pub fn risk_timeout(&self) -> Duration {
        Duration::from_millis(self.risk_timeout_ms)
    }

    /// Mixed traffic against a healthy scorer.
    fn steady() -> Self {
        Self {
            name: "steady".to_string(),
            description: "Mixed transfers and requests, healthy risk service".to_string(),
            transfer_share: 0.7,
            accept_share: 0.6,
            hot_accounts: None,
            min_amount: 1,
            max_amount: 400,
            risk_timeout_ms: 200,
            scorer: ScorerProfile::healthy(),
        }
    }

    /// Every transfer drains one of a few accounts, so most attempts race for
    /// the same locks and many hit insufficient funds.
    fn contention() -> Self {
        Self {
            name: "contention".to_string(),
            description: "Concurrent transfers out of a handful of hot accounts".to_string(),
            transfer_share: 0.9,
            accept_share: 0.8,
            hot_accounts: Some(2),
            min_amount: 50,
            max_amount: 600,
            risk_timeout_ms: 200,
            scorer: ScorerProfile::healthy(),
        }
    }

    /// The risk service stalls and fails often; transfers must still flow on
    /// the fallback verdict.
    fn degraded_risk() -> Self {
        Self {
            name: "degraded-risk".to_string(),
            description: "Risk service stalls past the timeout or errors".to_string(),
            transfer_share: 0.7,
            accept_share: 0.6,
            hot_accounts: None,
            min_amount: 1,
            max_amount: 400,
            risk_timeout_ms: 25,
            scorer: ScorerProfile {
                stall_rate: 0.3,
                failure_rate: 0.2,
                fraud_rate: 0.02,
                latency_ms: 5,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_known_scenarios() {
        for name in ["steady", "contention", "degraded-risk"] {
            let scenario = Scenario::load(name).unwrap();
            assert_eq!(scenario.name, name);
            assert!(scenario.min_amount <= scenario.max_amount);
        }
        assert!(Scenario::load("simple-settlement").is_err());
    }

    #[test]
    fn test_degraded_scorer_stalls_past_timeout() {
        let scenario = Scenario::load("degraded-risk").unwrap();
        assert!(scenario.scorer.stall_rate > 0.0);
        assert!(scenario.risk_timeout() < Duration::from_millis(100));
    }
}
