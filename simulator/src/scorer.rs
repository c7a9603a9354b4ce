//! Unreliable risk service for simulation runs.

use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;

use bankcore_risk::{RiskError, RiskRequest, RiskResponse, RiskResult, RiskScorer, RuleScorer};

use crate::scenario::ScorerProfile;

/// How long a stalled call sleeps. Always past any scenario timeout.
const STALL: Duration = Duration::from_secs(2);

/// Wraps the rule scorer with random stalls, failures and fraud verdicts.
pub struct FlakyScorer {
    inner: RuleScorer,
    profile: ScorerProfile,
    rng: Mutex<StdRng>,
}

enum Roll {
    Stall,
    Fail,
    Fraud,
    Healthy,
}

impl FlakyScorer {
    pub fn new(profile: ScorerProfile, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            inner: RuleScorer::default(),
            profile,
            rng: Mutex::new(rng),
        }
    }

    async fn roll(&self) -> Roll {
        let x: f64 = self.rng.lock().await.gen();
        let p = &self.profile;
        if x < p.stall_rate {
            Roll::Stall
        } else if x < p.stall_rate + p.failure_rate {
            Roll::Fail
        } else if x < p.stall_rate + p.failure_rate + p.fraud_rate {
            Roll::Fraud
        } else {
            Roll::Healthy
        }
    }
}

#[async_trait]
impl RiskScorer for FlakyScorer {
    fn name(&self) -> &str {
        "FLAKY"
    }

    async fn score(&self, request: &RiskRequest) -> RiskResult<RiskResponse> {
        match self.roll().await {
            Roll::Stall => {
                tokio::time::sleep(STALL).await;
                self.inner.score(request).await
            }
            Roll::Fail => Err(RiskError::Transport("simulated outage".to_string())),
            Roll::Fraud => Ok(RiskResponse::verdict(0.95, true, "Simulated fraud ring", 0.9)),
            Roll::Healthy => {
                tokio::time::sleep(Duration::from_millis(self.profile.latency_ms)).await;
                self.inner.score(request).await
            }
        }
    }
}
