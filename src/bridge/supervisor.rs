// ABOUTME: Bridge supervisor owning the pool, session registry, recovery layer and health loop
// ABOUTME: Public entry point: start, execute, end_session, status and shutdown

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::circuit_breaker::CircuitSummary;
use super::config::BridgeConfig;
use super::error::BridgeResult;
use super::health::{aggregate_health_status, HealthMonitor, HealthStatus};
use super::metrics::{BridgeMetrics, ErrorCounts};
use super::pool::{CleanupOutcome, ShutdownReport, WorkerPool};
use super::recovery::{RecoveryLayer, RecoveryStrategy};
use super::session::SessionRegistry;
use super::worker::WorkerSnapshot;

// === Request ===

/// One command to run on some worker
#[derive(Debug, Clone)]
pub struct BridgeRequest {
    command: String,
    args: Value,
    session_id: Option<String>,
    idempotent: Option<bool>,
    strategy: Option<RecoveryStrategy>,
}

impl BridgeRequest {
    /// Command with its argument payload
    pub fn new(command: impl Into<String>, args: Value) -> Self {
        Self {
            command: command.into(),
            args,
            session_id: None,
            idempotent: None,
            strategy: None,
        }
    }

    /// Run under a session
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Override the configured idempotency of the command
    #[must_use]
    pub const fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }

    /// Use an explicit recovery strategy
    #[must_use]
    pub fn with_strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Command name
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Session the request runs under
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Arguments as sent to the worker, with `session_id` injected
    pub fn wire_args(&self) -> Value {
        let Some(session_id) = &self.session_id else {
            return self.args.clone();
        };

        let mut object = match &self.args {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        object.insert("session_id".to_string(), Value::String(session_id.clone()));
        Value::Object(object)
    }

    fn strategy(&self, config: &BridgeConfig) -> RecoveryStrategy {
        if let Some(strategy) = &self.strategy {
            return strategy.clone();
        }
        let idempotent = self
            .idempotent
            .unwrap_or_else(|| config.recovery.is_idempotent(&self.command));
        RecoveryStrategy::for_idempotency(idempotent)
    }
}

// === Status ===

/// Everything the external supervisor can observe
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    /// Target worker count
    pub pool_size: usize,
    /// Extra workers allowed under load
    pub max_overflow: usize,
    /// Workers alive or being spawned
    pub live_workers: usize,
    /// Idle workers
    pub free_workers: usize,
    /// Leased workers
    pub busy_workers: usize,
    /// Workers beyond target size
    pub overflow_in_use: usize,
    /// Shutdown started
    pub draining: bool,
    /// Per-worker detail
    pub workers: Vec<WorkerSnapshot>,
    /// Sessions currently registered
    pub active_sessions: usize,
    /// Errors by category and kind
    pub error_counts: ErrorCounts,
    /// Requests submitted
    pub total_requests: u64,
    /// Requests that returned a result
    pub total_successes: u64,
    /// Replacement workers brought up
    pub workers_replaced: u64,
    /// Breaker state per failure class
    pub circuit: Vec<CircuitSummary>,
    /// End of the last health sweep
    pub last_health_check: Option<DateTime<Utc>>,
    /// Aggregated pool health
    pub health: HealthStatus,
    /// When the bridge started
    pub started_at: DateTime<Utc>,
}

// === Bridge ===

/// Top-level lifecycle owner
pub struct Bridge {
    config: Arc<BridgeConfig>,
    pool: Arc<WorkerPool>,
    sessions: Arc<SessionRegistry>,
    recovery: RecoveryLayer,
    metrics: Arc<BridgeMetrics>,
    monitor: Mutex<HealthMonitor>,
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("pool", &self.pool)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl Bridge {
    /// Validate the config, start the session registry, the pool and the
    /// health loop
    pub async fn start(config: BridgeConfig) -> BridgeResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let sessions = Arc::new(SessionRegistry::new());
        let metrics = Arc::new(BridgeMetrics::new());
        let pool = Arc::new(WorkerPool::start(&config, Arc::clone(&metrics)).await?);

        let mut monitor = HealthMonitor::from_config(&config);
        monitor.start(Arc::clone(&pool), Arc::clone(&sessions));

        info!(
            command = %config.worker.command,
            size = config.pool.size,
            max_overflow = config.pool.max_overflow,
            "Bridge started"
        );

        Ok(Self {
            recovery: RecoveryLayer::new(&config.recovery),
            config,
            pool,
            sessions,
            metrics,
            monitor: Mutex::new(monitor),
            started_at: Utc::now(),
        })
    }

    /// Fresh session id
    #[must_use]
    pub fn new_session_id() -> String {
        SessionRegistry::generate_session_id()
    }

    /// Configuration the bridge was started with
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Underlying worker pool
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Session registry
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Cumulative counters
    pub fn metrics(&self) -> &BridgeMetrics {
        &self.metrics
    }

    /// Run a command on a pooled worker under the request's recovery strategy
    pub async fn execute(&self, request: BridgeRequest) -> BridgeResult<Value> {
        self.metrics.request_started();
        if let Some(session_id) = request.session_id() {
            self.sessions.touch(session_id);
        }

        let strategy = request.strategy(&self.config);
        let args = request.wire_args();
        let command = request.command();
        let session = request.session_id();
        let checkout_timeout = self.config.pool.checkout_timeout;
        let pool = &self.pool;
        let sessions = &self.sessions;
        let args = &args;

        let result = self
            .recovery
            .run(command, &strategy, |attempt| async move {
                let lease = pool.checkout(session, checkout_timeout).await?;
                if let Some(session_id) = session {
                    sessions.record_worker(session_id, lease.worker_id());
                }
                debug!(command = %command, worker_id = %lease.worker_id(), attempt, "Dispatching request");
                lease.send(command, args).await
            })
            .await;

        match &result {
            Ok(_) => self.metrics.request_succeeded(),
            Err(err) => {
                self.metrics.record_error(err);
                debug!(command = %command, kind = err.kind(), error = %err, "Request failed");
            }
        }
        result
    }

    /// End a session and ask its last worker to drop its state
    ///
    /// Returns `None` for unknown sessions. Cleanup failures are logged by the
    /// pool and reported in the outcome, never raised.
    pub async fn end_session(&self, session_id: &str) -> Option<CleanupOutcome> {
        let hint = self.sessions.end_session(session_id)?;
        Some(self.pool.dispatch_cleanup(&hint).await)
    }

    /// Run one health sweep now
    ///
    /// The failures are kept for `status` the same way a background sweep keeps them.
    pub async fn health_sweep(&self) -> HealthStatus {
        let (health, failed) = HealthMonitor::sweep_once(&self.pool).await;
        self.monitor.lock().await.record_failed(failed);
        health
    }

    /// Reap idle sessions now
    pub async fn reap_sessions(&self) -> usize {
        HealthMonitor::reap_once(
            &self.pool,
            &self.sessions,
            self.config.session.session_idle_timeout,
        )
        .await
    }

    /// Current status surface
    pub async fn status(&self) -> BridgeStatus {
        let pool = self.pool.status();
        let failed = self.monitor.lock().await.last_failed();
        let health = aggregate_health_status(&pool, &failed);

        BridgeStatus {
            pool_size: pool.size,
            max_overflow: pool.max_overflow,
            live_workers: pool.live_workers,
            free_workers: pool.free_workers,
            busy_workers: pool.busy_workers,
            overflow_in_use: pool.overflow_in_use,
            draining: pool.draining,
            workers: pool.workers,
            active_sessions: self.sessions.active_count(),
            error_counts: self.metrics.error_counts(),
            total_requests: BridgeMetrics::load(&self.metrics.total_requests),
            total_successes: BridgeMetrics::load(&self.metrics.total_successes),
            workers_replaced: BridgeMetrics::load(&self.metrics.workers_replaced),
            circuit: self.recovery.circuit_summaries(),
            last_health_check: self.metrics.last_health_check(),
            health,
            started_at: self.started_at,
        }
    }

    /// Stop the health loop, drain the pool and kill what remains after
    /// `timeout`
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.monitor.lock().await.stop().await;
        let report = self.pool.shutdown(timeout).await;
        info!(
            sessions = self.sessions.active_count(),
            forced = report.forced,
            "Bridge stopped"
        );
        report
    }
}
