// ABOUTME: Cumulative counters for the bridge status surface
//
// Tracks:
// - Requests: total, success, errors by category and kind
// - Workers: spawned, replaced, spawn failures
// - Sessions: cleanup dispatches and failures
// - Last health sweep time

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::{BridgeError, ErrorCategory};

/// Bridge-wide metrics
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    /// Requests submitted to `execute`
    pub total_requests: AtomicU64,
    /// Requests that returned a result
    pub total_successes: AtomicU64,
    /// Workers that completed their handshake
    pub workers_spawned: AtomicU64,
    /// Replacement workers brought up after a loss
    pub workers_replaced: AtomicU64,
    /// Spawns or handshakes that failed
    pub spawn_failures: AtomicU64,
    /// `cleanup_session` dispatches attempted
    pub cleanups_dispatched: AtomicU64,
    /// Cleanup dispatches that failed
    pub cleanup_failures: AtomicU64,
    errors_by_kind: Mutex<BTreeMap<(ErrorCategory, &'static str), u64>>,
    last_health_check: Mutex<Option<DateTime<Utc>>>,
}

/// Error totals keyed by category and by kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorCounts {
    /// All errors
    pub total: u64,
    /// Errors per category, every category present
    pub by_category: BTreeMap<String, u64>,
    /// Errors per kind, only kinds seen
    pub by_kind: BTreeMap<String, u64>,
}

impl ErrorCounts {
    /// Count for one kind, zero if never seen
    pub fn kind(&self, kind: &str) -> u64 {
        self.by_kind.get(kind).copied().unwrap_or(0)
    }
}

impl BridgeMetrics {
    /// Zeroed metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a submitted request
    pub fn request_started(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a successful request
    pub fn request_succeeded(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a final error by category and kind
    pub fn record_error(&self, err: &BridgeError) {
        let mut errors = self
            .errors_by_kind
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *errors.entry((err.category(), err.kind())).or_insert(0) += 1;
    }

    /// Count a started worker
    pub fn worker_spawned(&self) {
        self.workers_spawned.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a replacement worker
    pub fn worker_replaced(&self) {
        self.workers_replaced.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed spawn
    pub fn spawn_failed(&self) {
        self.spawn_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a cleanup dispatch and whether it failed
    pub fn cleanup_dispatched(&self, ok: bool) {
        self.cleanups_dispatched.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.cleanup_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Stamp the end of a health sweep
    pub fn health_checked(&self) {
        *self
            .last_health_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }

    /// When the last health sweep finished
    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        *self
            .last_health_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of error totals
    pub fn error_counts(&self) -> ErrorCounts {
        let errors = self
            .errors_by_kind
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut counts = ErrorCounts {
            by_category: ErrorCategory::ALL
                .iter()
                .map(|c| (c.as_str().to_string(), 0))
                .collect(),
            ..ErrorCounts::default()
        };
        for ((category, kind), n) in errors.iter() {
            counts.total += n;
            *counts
                .by_category
                .entry(category.as_str().to_string())
                .or_insert(0) += n;
            counts.by_kind.insert((*kind).to_string(), *n);
        }
        counts
    }

    /// Read a counter
    pub fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_counts_by_category_and_kind() {
        let metrics = BridgeMetrics::new();
        let timeout = BridgeError::CheckoutTimeout {
            waited: Duration::from_millis(1),
            timeout: Duration::from_millis(1),
        };
        metrics.record_error(&timeout);
        metrics.record_error(&timeout);
        metrics.record_error(&BridgeError::Internal("x".to_string()));

        let counts = metrics.error_counts();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.by_category["timeout_error"], 2);
        assert_eq!(counts.by_category["system_error"], 1);
        assert_eq!(counts.by_category["resource_error"], 0);
        assert_eq!(counts.kind("checkout_timeout"), 2);
        assert_eq!(counts.kind("stream_closed"), 0);
    }

    #[test]
    fn test_counters() {
        let metrics = BridgeMetrics::new();
        metrics.request_started();
        metrics.request_succeeded();
        metrics.cleanup_dispatched(true);
        metrics.cleanup_dispatched(false);

        assert_eq!(BridgeMetrics::load(&metrics.total_requests), 1);
        assert_eq!(BridgeMetrics::load(&metrics.cleanups_dispatched), 2);
        assert_eq!(BridgeMetrics::load(&metrics.cleanup_failures), 1);
        assert!(metrics.last_health_check().is_none());
        metrics.health_checked();
        assert!(metrics.last_health_check().is_some());
    }
}
