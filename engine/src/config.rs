//! Engine configuration.

use std::time::Duration;

use bankcore_common::{constants, BankError, DurationExt, Result};
use bankcore_ledger::DatabaseConfig;
use bankcore_risk::{FallbackPolicy, RiskGateConfig};

/// Risk gate configuration.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Upper bound on one scorer call.
    pub timeout: Duration,
    /// Transfers scoring above this are blocked.
    pub block_threshold: f64,
    /// Pre-checks scoring above this raise an advisory alert.
    pub advisory_threshold: f64,
    /// External scorer command line. `None` uses the in-process rules.
    pub scorer_command: Option<String>,
    /// Verdict used when the scorer is degraded.
    pub fallback: FallbackPolicy,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            timeout: constants::risk_timeout().as_std(),
            block_threshold: 0.85,
            advisory_threshold: 0.8,
            scorer_command: None,
            fallback: FallbackPolicy::default(),
        }
    }
}

impl RiskConfig {
    pub fn gate_config(&self) -> RiskGateConfig {
        RiskGateConfig {
            timeout: self.timeout,
            fallback: self.fallback.clone(),
        }
    }
}

/// How much history feeds the risk gate.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub window: chrono::Duration,
    pub limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            window: constants::history_window(),
            limit: constants::HISTORY_LIMIT,
        }
    }
}

/// Main engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Risk gate configuration.
    pub risk: RiskConfig,
    /// History configuration.
    pub history: HistoryConfig,
    /// Log level.
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            risk: RiskConfig::default(),
            history: HistoryConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self {
            database: DatabaseConfig::from_env(),
            ..Self::default()
        };

        if let Some(ms) = env_parse::<u64>("RISK_TIMEOUT_MS") {
            config.risk.timeout = Duration::from_millis(ms);
        }
        if let Some(threshold) = env_parse("RISK_BLOCK_THRESHOLD") {
            config.risk.block_threshold = threshold;
        }
        if let Some(threshold) = env_parse("RISK_ADVISORY_THRESHOLD") {
            config.risk.advisory_threshold = threshold;
        }
        if let Ok(command) = std::env::var("RISK_SCORER_COMMAND") {
            if !command.trim().is_empty() {
                config.risk.scorer_command = Some(command);
            }
        }
        if let Some(days) = env_parse::<i64>("HISTORY_WINDOW_DAYS") {
            config.history.window = chrono::Duration::days(days);
        }
        if let Some(limit) = env_parse("HISTORY_LIMIT") {
            config.history.limit = limit;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Err(BankError::Configuration(message.to_string()));

        if self.database.url.is_empty() {
            return invalid("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            return invalid("Database pool needs at least one connection");
        }
        if self.risk.timeout.is_zero() {
            return invalid("Risk timeout cannot be zero");
        }
        for threshold in [self.risk.block_threshold, self.risk.advisory_threshold] {
            if !(0.0..=1.0).contains(&threshold) {
                return invalid("Risk thresholds must be within [0, 1]");
            }
        }
        if self.risk.advisory_threshold > self.risk.block_threshold {
            return invalid("Advisory threshold cannot exceed block threshold");
        }
        if self.history.window <= chrono::Duration::zero() {
            return invalid("History window must be positive");
        }
        if self.history.limit == 0 {
            return invalid("History limit cannot be 0");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.risk.timeout, Duration::from_secs(2));
        assert_eq!(config.history.limit, 50);
        assert_eq!(config.history.window, chrono::Duration::days(30));
    }

    #[test]
    fn test_invalid_thresholds() {
        let mut config = EngineConfig::default();
        config.risk.advisory_threshold = 0.9;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.risk.block_threshold = 1.5;
        let err = config.validate().unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn test_invalid_timeout_and_url() {
        let mut config = EngineConfig::default();
        config.risk.timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.database.url.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gate_config_carries_timeout() {
        let mut config = RiskConfig::default();
        config.timeout = Duration::from_millis(150);
        assert_eq!(config.gate_config().timeout, Duration::from_millis(150));
    }
}
