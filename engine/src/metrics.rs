//! Metrics collection for the transfer engine.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Engine metrics.
#[derive(Default)]
pub struct EngineMetrics {
    transfers_attempted: AtomicU64,
    transfers_committed: AtomicU64,
    transfers_failed: AtomicU64,
    transfers_blocked: AtomicU64,
    transfers_active: AtomicU64,
    deposits: AtomicU64,
    risk_fallbacks: AtomicU64,
    alerts_recorded: AtomicU64,
    alerts_dropped: AtomicU64,
    requests_created: AtomicU64,
    requests_accepted: AtomicU64,
    requests_rejected: AtomicU64,
}

impl EngineMetrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transfer_started(&self) {
        self.transfers_attempted.fetch_add(1, Ordering::Relaxed);
        self.transfers_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_committed(&self) {
        self.transfers_committed.fetch_add(1, Ordering::Relaxed);
        self.transfers_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn transfer_failed(&self) {
        self.transfers_failed.fetch_add(1, Ordering::Relaxed);
        self.transfers_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn transfer_blocked(&self) {
        self.transfers_blocked.fetch_add(1, Ordering::Relaxed);
        self.transfers_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn deposit_committed(&self) {
        self.deposits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn risk_fallback(&self) {
        self.risk_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alert_recorded(&self) {
        self.alerts_recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// Alert sink refused a write.
    pub fn alert_dropped(&self) {
        self.alerts_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_created(&self) {
        self.requests_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_accepted(&self) {
        self.requests_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            transfers_attempted: load(&self.transfers_attempted),
            transfers_committed: load(&self.transfers_committed),
            transfers_failed: load(&self.transfers_failed),
            transfers_blocked: load(&self.transfers_blocked),
            transfers_active: load(&self.transfers_active),
            deposits: load(&self.deposits),
            risk_fallbacks: load(&self.risk_fallbacks),
            alerts_recorded: load(&self.alerts_recorded),
            alerts_dropped: load(&self.alerts_dropped),
            requests_created: load(&self.requests_created),
            requests_accepted: load(&self.requests_accepted),
            requests_rejected: load(&self.requests_rejected),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let series: [(&str, &str, &str, u64); 12] = [
            ("transfers_attempted", "counter", "Total transfers attempted", s.transfers_attempted),
            ("transfers_committed", "counter", "Total transfers committed", s.transfers_committed),
            ("transfers_failed", "counter", "Total transfers failed", s.transfers_failed),
            ("transfers_blocked", "counter", "Total transfers blocked by the risk gate", s.transfers_blocked),
            ("transfers_active", "gauge", "Transfers in flight", s.transfers_active),
            ("deposits", "counter", "Total external credits", s.deposits),
            ("risk_fallbacks", "counter", "Risk verdicts produced by the local fallback", s.risk_fallbacks),
            ("alerts_recorded", "counter", "Fraud alerts persisted", s.alerts_recorded),
            ("alerts_dropped", "counter", "Fraud alerts the sink failed to persist", s.alerts_dropped),
            ("requests_created", "counter", "Transfer requests created", s.requests_created),
            ("requests_accepted", "counter", "Transfer requests accepted", s.requests_accepted),
            ("requests_rejected", "counter", "Transfer requests rejected", s.requests_rejected),
        ];

        let mut out = String::new();
        for (name, kind, help, value) in series {
            // Writing to a String cannot fail.
            let _ = writeln!(out, "# HELP bankcore_{name} {help}");
            let _ = writeln!(out, "# TYPE bankcore_{name} {kind}");
            let _ = writeln!(out, "bankcore_{name} {value}\n");
        }
        out
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub transfers_attempted: u64,
    pub transfers_committed: u64,
    pub transfers_failed: u64,
    pub transfers_blocked: u64,
    pub transfers_active: u64,
    pub deposits: u64,
    pub risk_fallbacks: u64,
    pub alerts_recorded: u64,
    pub alerts_dropped: u64,
    pub requests_created: u64,
    pub requests_accepted: u64,
    pub requests_rejected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = EngineMetrics::new();

        metrics.transfer_started();
        metrics.transfer_started();
        metrics.transfer_started();
        metrics.transfer_committed();
        metrics.transfer_blocked();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.transfers_attempted, 3);
        assert_eq!(snapshot.transfers_committed, 1);
        assert_eq!(snapshot.transfers_blocked, 1);
        assert_eq!(snapshot.transfers_active, 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = EngineMetrics::new();
        metrics.transfer_started();
        metrics.risk_fallback();

        let output = metrics.to_prometheus();
        assert!(output.contains("bankcore_transfers_attempted 1"));
        assert!(output.contains("# TYPE bankcore_transfers_active gauge"));
        assert!(output.contains("bankcore_risk_fallbacks 1"));
    }
}
