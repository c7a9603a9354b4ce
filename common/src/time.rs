//! Time utilities and constants for bankcore.

use chrono::{DateTime, Duration, Utc};

/// Timing constants.
pub mod constants {
    use super::Duration;

    /// Trailing window of history fed to the risk gate (30 days).
    pub fn history_window() -> Duration {
        Duration::days(30)
    }

    /// Maximum history rows fed to the risk gate.
    pub const HISTORY_LIMIT: usize = 50;

    /// Default bound on a single risk scorer call (2 seconds).
    pub fn risk_timeout() -> Duration {
        Duration::seconds(2)
    }

    /// Maximum wait for an exclusive account or request lock (10 seconds).
    pub fn lock_acquisition_timeout() -> Duration {
        Duration::seconds(10)
    }
}

/// A timestamp (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Start of a trailing window ending now.
pub fn window_start(window: Duration) -> Timestamp {
    now() - window
}

/// Duration extensions for convenient construction.
pub trait DurationExt {
    fn as_std(&self) -> std::time::Duration;
}

impl DurationExt for Duration {
    fn as_std(&self) -> std::time::Duration {
        self.to_std().unwrap_or(std::time::Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_start() {
        let start = window_start(constants::history_window());
        let age = now() - start;
        assert!(age >= Duration::days(30));
        assert!(age < Duration::days(30) + Duration::seconds(5));
    }

    #[test]
    fn test_negative_duration_clamps_to_zero() {
        assert_eq!(Duration::seconds(-3).as_std(), std::time::Duration::ZERO);
        assert_eq!(
            constants::risk_timeout().as_std(),
            std::time::Duration::from_secs(2)
        );
    }
}
