//! Publish/forward statistics
//!
//! One [`ForwardStatistics`] instance is owned by the node and shared (via
//! `Arc`) with every statement subscriber it creates. Counters are plain
//! atomics: they feed dashboards and play no part in correctness.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Default)]
pub struct ForwardStatistics {
    local_publish_success: AtomicU64,
    local_publish_failure: AtomicU64,
    forward_success: AtomicU64,
    forward_failure: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatisticsSnapshot {
    pub timestamp: i64,
    pub local_publish_success: u64,
    pub local_publish_failure: u64,
    pub forward_success: u64,
    pub forward_failure: u64,
}

impl StatisticsSnapshot {
    /// Header and value lines for CSV output
    pub fn to_csv(&self) -> (String, String) {
        (
            "timestamp,OUT.publish.success,OUT.publish.failure,OUT.forward.success,OUT.forward.failure"
                .to_string(),
            format!(
                "{},{},{},{},{}",
                self.timestamp,
                self.local_publish_success,
                self.local_publish_failure,
                self.forward_success,
                self.forward_failure
            ),
        )
    }
}

impl ForwardStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_local_publish(&self, success: bool) {
        let counter = if success {
            &self.local_publish_success
        } else {
            &self.local_publish_failure
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_forward(&self, success: bool) {
        let counter = if success {
            &self.forward_success
        } else {
            &self.forward_failure
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            timestamp: Utc::now().timestamp_millis(),
            local_publish_success: self.local_publish_success.load(Ordering::Relaxed),
            local_publish_failure: self.local_publish_failure.load(Ordering::Relaxed),
            forward_success: self.forward_success.load(Ordering::Relaxed),
            forward_failure: self.forward_failure.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.local_publish_success.store(0, Ordering::Relaxed);
        self.local_publish_failure.store(0, Ordering::Relaxed);
        self.forward_success.store(0, Ordering::Relaxed);
        self.forward_failure.store(0, Ordering::Relaxed);
    }
}
