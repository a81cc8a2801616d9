//! Per-backend health tracking.
//!
//! Counts consecutive failures and classifies each backend. Purely
//! observational: nothing here blocks or rejects a call.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Consecutive failures before a backend is marked unhealthy.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// No outcome recorded yet; treated as healthy.
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Default)]
struct HealthRecord {
    consecutive_failures: u32,
    total_calls: u64,
    total_failures: u64,
    total_successes: u64,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    status: HealthStatus,
}

/// Point-in-time statistics of one backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStats {
    pub server: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    /// Percentage of failed calls; 0 with no calls.
    pub failure_rate: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl HealthStats {
    fn from_record(server: &str, record: &HealthRecord) -> Self {
        let failure_rate = if record.total_calls == 0 {
            0.0
        } else {
            record.total_failures as f64 / record.total_calls as f64 * 100.0
        };

        Self {
            server: server.to_string(),
            status: record.status,
            consecutive_failures: record.consecutive_failures,
            total_calls: record.total_calls,
            total_failures: record.total_failures,
            total_successes: record.total_successes,
            failure_rate,
            last_success: record.last_success,
            last_failure: record.last_failure,
        }
    }
}

pub struct HealthTracker {
    threshold: u32,
    records: RwLock<HashMap<String, HealthRecord>>,
}

impl HealthTracker {
    /// A zero threshold falls back to the default.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: if threshold == 0 {
                DEFAULT_FAILURE_THRESHOLD
            } else {
                threshold
            },
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn record_success(&self, server: &str) {
        let mut records = self.records.write();
        let record = records.entry(server.to_string()).or_default();
        record.consecutive_failures = 0;
        record.total_calls += 1;
        record.total_successes += 1;
        record.last_success = Some(Utc::now());
        record.status = HealthStatus::Healthy;
    }

    pub fn record_failure(&self, server: &str) {
        let mut records = self.records.write();
        let record = records.entry(server.to_string()).or_default();
        record.consecutive_failures += 1;
        record.total_calls += 1;
        record.total_failures += 1;
        record.last_failure = Some(Utc::now());

        if record.consecutive_failures >= self.threshold {
            if record.status != HealthStatus::Unhealthy {
                tracing::warn!(
                    server,
                    consecutive_failures = record.consecutive_failures,
                    "server marked unhealthy"
                );
            }
            record.status = HealthStatus::Unhealthy;
        }
    }

    pub fn status(&self, server: &str) -> HealthStatus {
        self.records
            .read()
            .get(server)
            .map(|r| r.status)
            .unwrap_or_default()
    }

    /// Anything but an explicit `Unhealthy` counts as healthy.
    pub fn is_healthy(&self, server: &str) -> bool {
        self.status(server) != HealthStatus::Unhealthy
    }

    /// Override after an out-of-band check; counters are kept.
    pub fn mark_healthy(&self, server: &str) {
        let mut records = self.records.write();
        let record = records.entry(server.to_string()).or_default();
        record.consecutive_failures = 0;
        record.status = HealthStatus::Healthy;
    }

    /// Forget one backend.
    pub fn reset(&self, server: &str) {
        self.records.write().remove(server);
    }

    pub fn clear(&self) {
        self.records.write().clear();
    }

    /// Statistics for one backend; unseen backends report zeroes.
    pub fn stats(&self, server: &str) -> HealthStats {
        let records = self.records.read();
        match records.get(server) {
            Some(record) => HealthStats::from_record(server, record),
            None => HealthStats::from_record(server, &HealthRecord::default()),
        }
    }

    /// Statistics of every backend with recorded outcomes, sorted by name.
    pub fn all_stats(&self) -> Vec<HealthStats> {
        let records = self.records.read();
        let mut stats: Vec<HealthStats> = records
            .iter()
            .map(|(server, record)| HealthStats::from_record(server, record))
            .collect();
        stats.sort_by(|a, b| a.server.cmp(&b.server));
        stats
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unseen_backend_is_unknown_and_healthy() {
        let tracker = HealthTracker::default();
        assert_eq!(tracker.status("ghost"), HealthStatus::Unknown);
        assert!(tracker.is_healthy("ghost"));
        assert_eq!(tracker.stats("ghost").failure_rate, 0.0);
    }

    #[test]
    fn test_unhealthy_exactly_at_threshold() {
        for threshold in 1..=5 {
            let tracker = HealthTracker::new(threshold);
            for failure in 1..=threshold {
                tracker.record_failure("github");
                let expected = failure == threshold;
                assert_eq!(
                    !tracker.is_healthy("github"),
                    expected,
                    "threshold {threshold}, failure {failure}"
                );
            }
        }
    }

    #[test]
    fn test_failure_below_threshold_keeps_status() {
        let tracker = HealthTracker::new(3);
        tracker.record_success("github");
        tracker.record_failure("github");
        tracker.record_failure("github");
        assert_eq!(tracker.status("github"), HealthStatus::Healthy);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let tracker = HealthTracker::new(2);
        tracker.record_failure("fs");
        tracker.record_failure("fs");
        assert_eq!(tracker.status("fs"), HealthStatus::Unhealthy);

        tracker.record_success("fs");
        assert_eq!(tracker.status("fs"), HealthStatus::Healthy);

        let stats = tracker.stats("fs");
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.total_failures, 2);
        assert_eq!(stats.total_successes, 1);
        assert!((stats.failure_rate - 66.666).abs() < 0.01);
        assert!(stats.last_success.is_some());
        assert!(stats.last_failure.is_some());
    }

    #[test]
    fn test_zero_threshold_uses_default() {
        assert_eq!(HealthTracker::new(0).threshold(), DEFAULT_FAILURE_THRESHOLD);
    }

    #[test]
    fn test_admin_overrides() {
        let tracker = HealthTracker::new(1);
        tracker.record_failure("a");
        tracker.record_failure("b");

        tracker.mark_healthy("a");
        assert_eq!(tracker.status("a"), HealthStatus::Healthy);
        assert_eq!(tracker.stats("a").total_failures, 1);

        tracker.reset("b");
        assert_eq!(tracker.status("b"), HealthStatus::Unknown);

        let names: Vec<String> = tracker.all_stats().into_iter().map(|s| s.server).collect();
        assert_eq!(names, vec!["a"]);

        tracker.clear();
        assert!(tracker.all_stats().is_empty());
    }
}
