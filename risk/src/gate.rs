//! The risk gate.
//!
//! Wraps a [`RiskScorer`] with a timeout and response validation. Any
//! failure is replaced by the [`FallbackPolicy`] verdict, so `assess` always
//! returns.

use std::sync::Arc;
use std::time::Duration;

use bankcore_common::{constants, CandidateTransaction, DurationExt, HistoryEntry, RiskAssessment};
use tracing::{debug, instrument, warn};

use crate::error::{RiskError, RiskResult};
use crate::fallback::FallbackPolicy;
use crate::scorer::RiskScorer;
use crate::wire::RiskRequest;

/// Configuration for the risk gate.
#[derive(Debug, Clone)]
pub struct RiskGateConfig {
    /// Upper bound on one scorer call.
    pub timeout: Duration,
    /// Verdict used when the scorer fails.
    pub fallback: FallbackPolicy,
}

impl Default for RiskGateConfig {
    fn default() -> Self {
        Self {
            timeout: constants::risk_timeout().as_std(),
            fallback: FallbackPolicy::default(),
        }
    }
}

/// Timeout-bounded risk scoring with local fallback.
#[derive(Clone)]
pub struct RiskGate {
    scorer: Arc<dyn RiskScorer>,
    config: RiskGateConfig,
}

impl RiskGate {
    pub fn new(scorer: Arc<dyn RiskScorer>, config: RiskGateConfig) -> Self {
        Self { scorer, config }
    }

    pub fn config(&self) -> &RiskGateConfig {
        &self.config
    }

    /// Score a candidate transfer. Never fails.
    #[instrument(skip_all, fields(amount = %candidate.amount, scorer = self.scorer.name()))]
    pub async fn assess(
        &self,
        candidate: &CandidateTransaction,
        history: &[HistoryEntry],
    ) -> RiskAssessment {
        match self.try_score(candidate, history).await {
            Ok(assessment) => {
                debug!(
                    risk_score = assessment.risk_score,
                    is_fraud = assessment.is_fraud,
                    "Risk scorer verdict"
                );
                assessment
            }
            Err(error) => {
                let assessment = self.config.fallback.assess(candidate, history);
                warn!(
                    error = %error,
                    risk_score = assessment.risk_score,
                    "Risk scorer degraded, using fallback verdict"
                );
                assessment
            }
        }
    }

    /// Score through the scorer only, surfacing its failures.
    pub async fn try_score(
        &self,
        candidate: &CandidateTransaction,
        history: &[HistoryEntry],
    ) -> RiskResult<RiskAssessment> {
        let request = RiskRequest::new(candidate, history);
        let response = tokio::time::timeout(self.config.timeout, self.scorer.score(&request))
            .await
            .map_err(|_| RiskError::Timeout(self.config.timeout))??;
        response.into_assessment()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::{REASON_NORMAL, REASON_VERY_LARGE};
    use crate::scorer::{MockScorer, ScriptedOutcome};
    use crate::wire::RiskResponse;
    use bankcore_common::{Amount, ExternalRef};
    use rust_decimal_macros::dec;
    use std::time::Instant;

    fn gate(scorer: Arc<MockScorer>, timeout: Duration) -> RiskGate {
        RiskGate::new(
            scorer,
            RiskGateConfig {
                timeout,
                ..Default::default()
            },
        )
    }

    fn candidate(amount: rust_decimal::Decimal) -> CandidateTransaction {
        CandidateTransaction::new(Amount::new(amount).unwrap(), ExternalRef::new("DEST-1"))
    }

    #[tokio::test]
    async fn test_passes_scorer_verdict_through() {
        let scorer = Arc::new(MockScorer::fraudulent(0.92));
        let verdict = gate(scorer.clone(), Duration::from_secs(1))
            .assess(&candidate(dec!(9000)), &[])
            .await;

        assert!(verdict.is_fraud);
        assert_eq!(verdict.risk_score, 0.92);
        assert!(!verdict.fallback);
        assert_eq!(scorer.calls(), 1);
    }

    #[tokio::test]
    async fn test_timeout_falls_back_within_bound() {
        let scorer = Arc::new(MockScorer::hanging(Duration::from_secs(30)));
        let started = Instant::now();
        let verdict = gate(scorer, Duration::from_millis(50))
            .assess(&candidate(dec!(100)), &[])
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(verdict.fallback);
        assert_eq!(verdict.risk_score, 0.2);
        assert_eq!(verdict.reason, REASON_NORMAL);
    }

    #[tokio::test]
    async fn test_malformed_and_failed_responses_fall_back() {
        let scorer = Arc::new(MockScorer::clean());
        scorer.push(ScriptedOutcome::Respond(RiskResponse::verdict(1.7, true, "bad", 0.7)));
        scorer.push(ScriptedOutcome::Respond(RiskResponse::failure("model missing")));
        scorer.push(ScriptedOutcome::Fail("broken pipe".to_string()));
        let degraded = gate(scorer, Duration::from_secs(1));

        for _ in 0..3 {
            let verdict = degraded.assess(&candidate(dec!(6000)), &[]).await;
            assert!(verdict.fallback);
            assert!(!verdict.is_fraud);
            assert_eq!(verdict.reason, REASON_VERY_LARGE);
        }

        let verdict = degraded.assess(&candidate(dec!(6000)), &[]).await;
        assert!(!verdict.fallback);
    }

    #[tokio::test]
    async fn test_try_score_surfaces_errors() {
        let failing = gate(Arc::new(MockScorer::unreachable()), Duration::from_secs(1));
        let err = failing.try_score(&candidate(dec!(1)), &[]).await.unwrap_err();
        assert!(matches!(err, RiskError::Transport(_)));

        let healthy = gate(Arc::new(MockScorer::clean()), Duration::from_secs(1));
        let verdict = tokio_test::assert_ok!(healthy.try_score(&candidate(dec!(1)), &[]).await);
        assert!(!verdict.fallback);
    }
}
