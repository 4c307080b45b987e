//! Observable replication health.
//!
//! Replication failures never fail a caller; they show up here instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::LocationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Broadcasts are reaching peers (or there are no peers to reach).
    Healthy,
    /// Some peers missed the last broadcast.
    Degraded,
    /// No peer could be reached; only local operations are effective.
    Isolated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub known_members: usize,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for HealthReport {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            known_members: 0,
            last_failure: None,
            last_error: None,
        }
    }
}

/// Publisher side of the health signal.
pub struct HealthMonitor {
    tx: watch::Sender<HealthReport>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(HealthReport::default());
        Self { tx }
    }

    pub fn current(&self) -> HealthReport {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthReport> {
        self.tx.subscribe()
    }

    pub fn record_success(&self) {
        self.tx.send_if_modified(|report| {
            if report.status == HealthStatus::Healthy {
                return false;
            }
            info!("Replication recovered ({:?} -> Healthy)", report.status);
            report.status = HealthStatus::Healthy;
            true
        });
    }

    pub fn record_failure(&self, err: &LocationError) {
        let status = match err {
            LocationError::MembershipUnavailable { .. } => HealthStatus::Isolated,
            _ => HealthStatus::Degraded,
        };
        warn!("Replication {:?}: {}", status, err);
        self.tx.send_modify(|report| {
            report.status = status;
            report.last_failure = Some(Utc::now());
            report.last_error = Some(err.to_string());
        });
    }

    pub fn set_known_members(&self, count: usize) {
        self.tx.send_if_modified(|report| {
            if report.known_members == count {
                return false;
            }
            report.known_members = count;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_then_recovery() {
        let monitor = HealthMonitor::new();
        assert_eq!(monitor.current().status, HealthStatus::Healthy);

        monitor.record_failure(&LocationError::MembershipUnavailable {
            message: "no peers reachable".into(),
        });
        let report = monitor.current();
        assert_eq!(report.status, HealthStatus::Isolated);
        assert!(report.last_failure.is_some());
        assert!(report.last_error.unwrap().contains("no peers reachable"));

        monitor.record_success();
        let report = monitor.current();
        assert_eq!(report.status, HealthStatus::Healthy);
        // Failure history is kept for diagnostics.
        assert!(report.last_failure.is_some());
    }

    #[test]
    fn test_partial_failure_is_degraded() {
        let monitor = HealthMonitor::new();
        monitor.record_failure(&LocationError::Other("peer b dropped the frame".into()));
        assert_eq!(monitor.current().status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_subscribers_see_member_count() {
        let monitor = HealthMonitor::new();
        let mut rx = monitor.subscribe();

        monitor.set_known_members(2);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().known_members, 2);
    }
}
