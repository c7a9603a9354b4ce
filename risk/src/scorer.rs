//! Risk scorer trait and test implementation.

use async_trait::async_trait;

use crate::error::RiskResult;
use crate::wire::{RiskRequest, RiskResponse};

/// Trait for risk scorers.
#[async_trait]
pub trait RiskScorer: Send + Sync {
    /// Get the scorer name.
    fn name(&self) -> &str;

    /// Score a candidate transfer.
    async fn score(&self, request: &RiskRequest) -> RiskResult<RiskResponse>;
}

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockScorer, ScriptedOutcome};

#[cfg(any(test, feature = "test-utils"))]
mod mock {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::RiskScorer;
    use crate::error::{RiskError, RiskResult};
    use crate::wire::{RiskRequest, RiskResponse};

    /// One scripted reply.
    #[derive(Debug, Clone)]
    pub enum ScriptedOutcome {
        Respond(RiskResponse),
        Fail(String),
        /// Sleep, then reply.
        Delay(Duration, RiskResponse),
    }

    /// Mock scorer for testing.
    ///
    /// Plays scripted outcomes in order, then repeats the default.
    pub struct MockScorer {
        script: Mutex<VecDeque<ScriptedOutcome>>,
        default: Mutex<ScriptedOutcome>,
        calls: AtomicU64,
        last_request: Mutex<Option<RiskRequest>>,
    }

    impl MockScorer {
        /// Scorer that always answers with `response`.
        pub fn new(response: RiskResponse) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                default: Mutex::new(ScriptedOutcome::Respond(response)),
                calls: AtomicU64::new(0),
                last_request: Mutex::new(None),
            }
        }

        /// Scorer that always answers with a low, clean score.
        pub fn clean() -> Self {
            Self::new(RiskResponse::verdict(0.1, false, "Normal transaction pattern", 0.7))
        }

        /// Scorer that always answers with a fraud verdict.
        pub fn fraudulent(score: f64) -> Self {
            Self::new(RiskResponse::verdict(score, true, "Very large transaction amount", 0.7))
        }

        /// Scorer that never answers in time.
        pub fn hanging(delay: Duration) -> Self {
            let scorer = Self::clean();
            scorer.set_default(ScriptedOutcome::Delay(
                delay,
                RiskResponse::verdict(0.1, false, "late", 0.7),
            ));
            scorer
        }

        /// Scorer whose transport always fails.
        pub fn unreachable() -> Self {
            let scorer = Self::clean();
            scorer.set_default(ScriptedOutcome::Fail("connection refused".to_string()));
            scorer
        }

        pub fn set_default(&self, outcome: ScriptedOutcome) {
            *self.default.lock() = outcome;
        }

        /// Queue a one-shot outcome.
        pub fn push(&self, outcome: ScriptedOutcome) {
            self.script.lock().push_back(outcome);
        }

        pub fn calls(&self) -> u64 {
            self.calls.load(Ordering::Relaxed)
        }

        pub fn last_request(&self) -> Option<RiskRequest> {
            self.last_request.lock().clone()
        }
    }

    #[async_trait]
    impl RiskScorer for MockScorer {
        fn name(&self) -> &str {
            "MOCK"
        }

        async fn score(&self, request: &RiskRequest) -> RiskResult<RiskResponse> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            *self.last_request.lock() = Some(request.clone());

            let outcome = self
                .script
                .lock()
                .pop_front()
                .unwrap_or_else(|| self.default.lock().clone());

            match outcome {
                ScriptedOutcome::Respond(response) => Ok(response),
                ScriptedOutcome::Fail(message) => Err(RiskError::Transport(message)),
                ScriptedOutcome::Delay(delay, response) => {
                    tokio::time::sleep(delay).await;
                    Ok(response)
                }
            }
        }
    }
}
