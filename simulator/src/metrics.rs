//! Simulation metrics.

use std::collections::VecDeque;

use bankcore_common::{BankError, ErrorKind};

/// Operations the simulator drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Transfer,
    RequestCreate,
    RequestAccept,
    RequestReject,
}

/// Simulation metrics.
#[derive(Debug, Clone)]
pub struct SimulationMetrics {
    /// Total operations attempted.
    pub total_operations: u64,
    pub transfers_committed: u64,
    pub requests_created: u64,
    pub requests_accepted: u64,
    pub requests_rejected: u64,
    /// Refusals for lack of funds.
    pub insufficient_funds: u64,
    /// Vetoes by the risk gate.
    pub blocked: u64,
    /// Every other failure.
    pub errors: u64,
    /// Latency samples (ms).
    latency_samples: VecDeque<u64>,
    /// Maximum samples to keep.
    max_samples: usize,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            total_operations: 0,
            transfers_committed: 0,
            requests_created: 0,
            requests_accepted: 0,
            requests_rejected: 0,
            insufficient_funds: 0,
            blocked: 0,
            errors: 0,
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    /// Record a successful operation.
    pub fn record_success(&mut self, operation: Operation, latency_ms: u64) {
        self.total_operations += 1;
        match operation {
            Operation::Transfer => self.transfers_committed += 1,
            Operation::RequestCreate => self.requests_created += 1,
            Operation::RequestAccept => self.requests_accepted += 1,
            Operation::RequestReject => self.requests_rejected += 1,
        }

        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_ms);
    }

    /// Record a failed operation.
    pub fn record_failure(&mut self, error: &BankError) {
        self.total_operations += 1;
        match error.kind() {
            ErrorKind::InsufficientFunds => self.insufficient_funds += 1,
            ErrorKind::Blocked => self.blocked += 1,
            _ => self.errors += 1,
        }
    }

    pub fn failures(&self) -> u64 {
        self.insufficient_funds + self.blocked + self.errors
    }

    /// Get average latency in ms.
    pub fn average_latency_ms(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    pub fn p99_latency_ms(&self) -> u64 {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Get success rate.
    pub fn success_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 0.0;
        }

        (self.total_operations - self.failures()) as f64 / self.total_operations as f64
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bankcore_common::AccountId;

    #[test]
    fn test_metrics() {
        let mut metrics = SimulationMetrics::new();

        metrics.record_success(Operation::Transfer, 100);
        metrics.record_success(Operation::RequestCreate, 200);
        metrics.record_success(Operation::RequestAccept, 150);
        metrics.record_failure(&BankError::InsufficientFunds {
            required: "10".to_string(),
            available: "5".to_string(),
        });

        assert_eq!(metrics.total_operations, 4);
        assert_eq!(metrics.transfers_committed, 1);
        assert_eq!(metrics.insufficient_funds, 1);
        assert_eq!(metrics.average_latency_ms(), 150);
        assert_eq!(metrics.p99_latency_ms(), 200);
        assert_eq!(metrics.success_rate(), 0.75);
    }

    #[test]
    fn test_failures_are_classified() {
        let mut metrics = SimulationMetrics::new();
        metrics.record_failure(&BankError::AccountNotFound(AccountId::new(1)));
        metrics.record_failure(&BankError::Storage("boom".to_string()));

        assert_eq!(metrics.errors, 2);
        assert_eq!(metrics.blocked, 0);
        assert_eq!(metrics.failures(), 2);
    }
}
