// ABOUTME: Background health sweep and stale-session reap for the worker pool
// ABOUTME: Aggregates per-worker probe results into an overall pool health status

//! Health monitoring for the worker pool.
//!
//! The `HealthMonitor` runs two background tasks that:
//! - Sweeps idle workers with a ping at `health_check_interval`
//! - Lets the pool evict failed workers and refill to target size
//! - Reaps sessions idle longer than `session_idle_timeout` every `reap_interval`
//!   and dispatches `cleanup_session` to the worker that served them
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    HealthMonitor                        │
//! │                                                         │
//! │  ┌──────────────┐    ┌──────────────┐                   │
//! │  │ Sweep tick   │───▶│ Pool health  │──▶ evict/replace  │
//! │  │ (interval)   │    │   sweep      │                   │
//! │  └──────────────┘    └──────────────┘                   │
//! │                             │                           │
//! │                             ▼                           │
//! │                      aggregate status                   │
//! │                                                         │
//! │  ┌──────────────┐    ┌──────────────┐                   │
//! │  │ Reap tick    │───▶│ Stale session│──▶ cleanup_session│
//! │  │ (interval)   │    │   reap       │                   │
//! │  └──────────────┘    └──────────────┘                   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let mut monitor = HealthMonitor::from_config(&config);
//! monitor.start(Arc::clone(&pool), Arc::clone(&sessions));
//!
//! // Later, stop gracefully
//! monitor.stop().await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::config::BridgeConfig;
use super::pool::{CleanupOutcome, PoolStatus, WorkerPool};
use super::session::SessionRegistry;
use super::worker::WorkerId;

// === Health Status ===

/// Overall health of the worker pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    /// At target size, every probed worker answered
    Healthy,

    /// Serving, but below target or with failed probes
    Degraded {
        /// Workers that failed their last probe
        unhealthy: Vec<String>,
    },

    /// No workers, or fewer than half of target
    Critical {
        /// What is wrong
        reason: String,
    },
}

impl HealthStatus {
    /// Check if the pool is fully healthy.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Check if the pool is critically short of workers.
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::Critical { .. })
    }

    /// Short label for logs and text output
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded { .. } => "degraded",
            Self::Critical { .. } => "critical",
        }
    }
}

/// Combine pool state and the latest probe failures into one status
#[must_use]
pub fn aggregate_health_status(status: &PoolStatus, failed: &[WorkerId]) -> HealthStatus {
    let running = status.free_workers + status.busy_workers;

    if running == 0 {
        return HealthStatus::Critical {
            reason: "no live workers".to_string(),
        };
    }
    if running * 2 < status.size {
        return HealthStatus::Critical {
            reason: format!("{running} of {} workers live", status.size),
        };
    }
    if !failed.is_empty() || running < status.size {
        return HealthStatus::Degraded {
            unhealthy: failed.iter().map(ToString::to_string).collect(),
        };
    }
    HealthStatus::Healthy
}

// === Health Monitor ===

/// Background health sweep and session reaper
pub struct HealthMonitor {
    /// Interval between pool sweeps.
    health_interval: Duration,

    /// Interval between stale-session reaps.
    reap_interval: Duration,

    /// Idle time after which a session is reaped.
    session_idle_timeout: Duration,

    /// Shutdown flag for graceful termination.
    shutdown: Arc<AtomicBool>,

    /// Wakes both loops when `stop` is called.
    wake: Arc<Notify>,

    /// Sweep and reap tasks; a slow reap never holds up a sweep.
    handles: Vec<JoinHandle<()>>,

    /// Workers that failed the most recent sweep.
    last_failed: Arc<RwLock<Vec<WorkerId>>>,
}

impl HealthMonitor {
    /// Create a monitor with explicit cadences
    #[must_use]
    pub fn new(
        health_interval: Duration,
        reap_interval: Duration,
        session_idle_timeout: Duration,
    ) -> Self {
        Self {
            health_interval,
            reap_interval,
            session_idle_timeout,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            handles: Vec::new(),
            last_failed: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Create a monitor from the bridge configuration
    #[must_use]
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            config.pool.health_check_interval,
            config.session.reap_interval,
            config.session.session_idle_timeout,
        )
    }

    /// Start the sweep and reap loops
    pub fn start(&mut self, pool: Arc<WorkerPool>, sessions: Arc<SessionRegistry>) {
        self.shutdown.store(false, Ordering::SeqCst);

        let loop_state = MonitorLoop {
            pool,
            sessions,
            health_interval: self.health_interval,
            reap_interval: self.reap_interval,
            session_idle_timeout: self.session_idle_timeout,
            shutdown: Arc::clone(&self.shutdown),
            wake: Arc::clone(&self.wake),
            last_failed: Arc::clone(&self.last_failed),
        };
        self.handles = vec![
            tokio::spawn(loop_state.clone().run_sweeps()),
            tokio::spawn(loop_state.run_reaps()),
        ];

        info!(
            health_interval_ms = %self.health_interval.as_millis(),
            reap_interval_ms = %self.reap_interval.as_millis(),
            "Health monitor started"
        );
    }

    /// Stop both loops and wait for them to finish
    pub async fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();

        for handle in self.handles.drain(..) {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                abort.abort();
            }
        }

        info!("Health monitor stopped");
    }

    /// Check if the monitor is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.handles.is_empty() && !self.shutdown.load(Ordering::SeqCst)
    }

    /// Workers that failed the most recent sweep
    #[must_use]
    pub fn last_failed(&self) -> Vec<WorkerId> {
        self.last_failed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Store the failures of a sweep run outside the loop
    pub fn record_failed(&self, failed: Vec<WorkerId>) {
        *self
            .last_failed
            .write()
            .unwrap_or_else(PoisonError::into_inner) = failed;
    }

    /// Run one sweep and log the aggregated result
    pub async fn sweep_once(pool: &WorkerPool) -> (HealthStatus, Vec<WorkerId>) {
        let report = pool.health_sweep().await;
        let failed = report.failed();
        let status = aggregate_health_status(&report.status, &failed);

        match &status {
            HealthStatus::Healthy => {
                debug!(workers = report.checks.len(), "All workers healthy");
            }
            HealthStatus::Degraded { unhealthy } => {
                warn!(
                    unhealthy = ?unhealthy,
                    live = report.status.live_workers,
                    replacements = report.replacements,
                    "Worker pool degraded"
                );
            }
            HealthStatus::Critical { reason } => {
                error!(reason = %reason, replacements = report.replacements, "Worker pool critical");
            }
        }
        (status, failed)
    }

    /// Reap idle sessions and dispatch their cleanups
    ///
    /// Returns the number of sessions reaped.
    pub async fn reap_once(
        pool: &WorkerPool,
        sessions: &SessionRegistry,
        max_idle: Duration,
    ) -> usize {
        let hints = sessions.reap_stale(max_idle);
        if hints.is_empty() {
            return 0;
        }

        let outcomes = join_all(hints.iter().map(|hint| pool.dispatch_cleanup(hint))).await;
        let cleaned = outcomes
            .iter()
            .filter(|o| matches!(o, CleanupOutcome::Cleaned))
            .count();
        info!(reaped = hints.len(), cleaned, "Reaped stale sessions");
        hints.len()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

/// State shared by the background tasks
#[derive(Clone)]
struct MonitorLoop {
    pool: Arc<WorkerPool>,
    sessions: Arc<SessionRegistry>,
    health_interval: Duration,
    reap_interval: Duration,
    session_idle_timeout: Duration,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
    last_failed: Arc<RwLock<Vec<WorkerId>>>,
}

impl MonitorLoop {
    async fn run_sweeps(self) {
        let mut tick = Self::ticker(self.health_interval);
        debug!("Health sweep loop started");

        while self.next_tick(&mut tick).await {
            let (_, failed) = HealthMonitor::sweep_once(&self.pool).await;
            *self
                .last_failed
                .write()
                .unwrap_or_else(PoisonError::into_inner) = failed;
        }

        debug!("Health sweep loop exiting");
    }

    async fn run_reaps(self) {
        let mut tick = Self::ticker(self.reap_interval);
        debug!("Session reap loop started");

        while self.next_tick(&mut tick).await {
            HealthMonitor::reap_once(&self.pool, &self.sessions, self.session_idle_timeout).await;
        }

        debug!("Session reap loop exiting");
    }

    fn ticker(period: Duration) -> Interval {
        let mut tick = tokio::time::interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick
    }

    /// Wait for the next tick; false once the monitor stops or the pool drains
    async fn next_tick(&self, tick: &mut Interval) -> bool {
        let wake = self.wake.notified();
        tokio::pin!(wake);
        // Registered before the flag check so a stop in between is not lost
        wake.as_mut().enable();

        if self.stopped() {
            return false;
        }
        tokio::select! {
            () = wake => false,
            _ = tick.tick() => !self.stopped(),
        }
    }

    fn stopped(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) || self.pool.is_draining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn status(size: usize, free: usize, busy: usize) -> PoolStatus {
        PoolStatus {
            size,
            max_overflow: 0,
            live_workers: free + busy,
            free_workers: free,
            busy_workers: busy,
            spawning: 0,
            overflow_in_use: (free + busy).saturating_sub(size),
            waiting: 0,
            draining: false,
            workers: Vec::new(),
        }
    }

    // ==================== Aggregation Tests ====================

    #[test]
    fn test_full_pool_is_healthy() {
        assert_eq!(aggregate_health_status(&status(4, 3, 1), &[]), HealthStatus::Healthy);
    }

    #[test]
    fn test_failed_probe_degrades() {
        let failed = [WorkerId::from_raw(7)];
        assert_eq!(
            aggregate_health_status(&status(4, 4, 0), &failed),
            HealthStatus::Degraded {
                unhealthy: vec!["worker-7".to_string()]
            }
        );
    }

    #[test]
    fn test_below_target_degrades() {
        let health = aggregate_health_status(&status(4, 2, 0), &[]);
        assert_eq!(health.as_str(), "degraded");
        assert!(!health.is_healthy());
    }

    #[test]
    fn test_under_half_is_critical() {
        assert!(aggregate_health_status(&status(4, 1, 0), &[]).is_critical());
        assert!(aggregate_health_status(&status(4, 0, 0), &[]).is_critical());
    }

    #[test]
    fn test_status_serializes_with_tag() {
        let json = serde_json::to_value(HealthStatus::Critical {
            reason: "no live workers".to_string(),
        })
        .unwrap();
        assert_eq!(json["status"], "critical");
        assert_eq!(json["reason"], "no live workers");
    }

    // ==================== Monitor Tests ====================

    #[tokio::test]
    async fn test_monitor_start_stop() {
        let mut config = BridgeConfig::default();
        config.worker.command = "true".to_string();
        config.pool.lazy = true;
        let pool = Arc::new(
            WorkerPool::start(&config, Arc::new(super::super::metrics::BridgeMetrics::new()))
                .await
                .unwrap(),
        );

        let mut monitor = HealthMonitor::new(
            Duration::from_millis(20),
            Duration::from_millis(20),
            Duration::from_secs(60),
        );
        assert!(!monitor.is_running());
        monitor.start(pool, Arc::new(SessionRegistry::new()));
        assert!(monitor.is_running());

        tokio::time::sleep(Duration::from_millis(60)).await;
        monitor.stop().await;
        assert!(!monitor.is_running());
    }

    #[test]
    fn test_record_failed_replaces_previous_sweep() {
        let monitor = HealthMonitor::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
        assert!(monitor.last_failed().is_empty());

        monitor.record_failed(vec![WorkerId::from_raw(3)]);
        assert_eq!(monitor.last_failed(), vec![WorkerId::from_raw(3)]);

        monitor.record_failed(Vec::new());
        assert!(monitor.last_failed().is_empty());
    }
}
