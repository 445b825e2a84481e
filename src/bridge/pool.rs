// ABOUTME: Worker pool with checkout/checkin leases, session affinity and replacement
// ABOUTME: Bookkeeping is a brief locked region; all worker I/O happens in the caller's task

//! Worker pool manager.
//!
//! The pool keeps `size` workers warm and may grow to `size + max_overflow`
//! under load. Callers check a worker out, talk to it directly through the
//! returned [`WorkerLease`], and the lease checks it back in when dropped.
//!
//! # Architecture
//!
//! ```text
//!   caller ──checkout──▶ ┌──────────────────────────────┐
//!                        │ Semaphore (size + overflow)  │  FIFO queue, bounded by
//!                        └──────────────┬───────────────┘  checkout_timeout
//!                                       ▼
//!                        ┌──────────────────────────────┐
//!                        │ PoolState (Mutex)            │
//!                        │  free: VecDeque  busy: Map   │──▶ affinity / any / spawn / wait
//!                        └──────────────┬───────────────┘
//!                                       ▼
//!   caller ◀──lease───── WorkerLease ── send_and_await (caller's task)
//!                                       │ drop
//!                                       ▼
//!                        checkin: free list, retire overflow, or evict + replace
//! ```
//!
//! Worker exits are delivered on a channel; idle workers that die are removed
//! and replaced immediately, busy ones are evicted when their lease returns.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::config::BridgeConfig;
use super::error::{BridgeError, BridgeResult};
use super::metrics::BridgeMetrics;
use super::recovery::ExponentialBackoff;
use super::session::CleanupHint;
use super::worker::{HealthProbe, WorkerHandle, WorkerId, WorkerSettings, WorkerSnapshot};

/// Spawn attempts per replacement trigger before leaving it to the next sweep
const REPLACEMENT_ATTEMPTS: u32 = 3;

// === Settings ===

/// Immutable pool parameters
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Target number of warm workers
    pub size: usize,
    /// Extra on-demand workers
    pub max_overflow: usize,
    /// Default checkout deadline
    pub checkout_timeout: Duration,
    /// Response deadline for lease I/O
    pub operation_timeout: Duration,
    /// Skip eager startup
    pub lazy: bool,
    /// First delay between replacement spawn attempts
    pub respawn_backoff_base: Duration,
    /// Cap for replacement spawn delays
    pub respawn_backoff_max: Duration,
}

impl PoolSettings {
    /// Derive pool settings from the bridge configuration
    #[must_use]
    pub const fn from_config(config: &BridgeConfig) -> Self {
        Self {
            size: config.pool.size,
            max_overflow: config.pool.max_overflow,
            checkout_timeout: config.pool.checkout_timeout,
            operation_timeout: config.pool.operation_timeout,
            lazy: config.pool.lazy,
            respawn_backoff_base: config.recovery.retry_backoff_base,
            respawn_backoff_max: config.recovery.retry_backoff_max,
        }
    }

    /// Pool-wide concurrency ceiling
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.size + self.max_overflow
    }
}

// === Reports ===

/// Point-in-time pool view
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    /// Target size
    pub size: usize,
    /// Overflow allowance
    pub max_overflow: usize,
    /// Workers alive or being spawned
    pub live_workers: usize,
    /// Idle workers
    pub free_workers: usize,
    /// Leased or being probed
    pub busy_workers: usize,
    /// Spawns in progress
    pub spawning: usize,
    /// Workers beyond `size`
    pub overflow_in_use: usize,
    /// Callers currently inside checkout
    pub waiting: usize,
    /// Shutdown started
    pub draining: bool,
    /// Per-worker detail
    pub workers: Vec<WorkerSnapshot>,
}

/// Result of probing one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCheck {
    /// Worker probed
    pub worker_id: WorkerId,
    /// Outcome
    pub probe: HealthProbe,
}

/// Result of a health sweep
#[derive(Debug, Clone)]
pub struct SweepReport {
    /// One entry per worker known at sweep time
    pub checks: Vec<WorkerCheck>,
    /// Replacement spawns started by this sweep
    pub replacements: usize,
    /// Pool state after the sweep
    pub status: PoolStatus,
}

impl SweepReport {
    /// Workers whose probe failed
    #[must_use]
    pub fn failed(&self) -> Vec<WorkerId> {
        self.checks
            .iter()
            .filter(|c| matches!(c.probe, HealthProbe::Failed(_)))
            .map(|c| c.worker_id)
            .collect()
    }
}

/// What happened to a session cleanup request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// `cleanup_session` was acknowledged
    Cleaned,
    /// No worker ever served the session
    NoWorker,
    /// The worker is gone; its state went with it
    WorkerGone,
    /// The worker could not be reached or refused
    Failed(String),
}

/// Result of a pool shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Idle workers stopped at drain start
    pub idle_terminated: usize,
    /// Leased workers that came back and were stopped
    pub drained: usize,
    /// Leased workers killed when the timeout elapsed
    pub forced: usize,
    /// Whether the wait for in-flight leases timed out
    pub timed_out: bool,
}

// === Pool State ===

#[derive(Default)]
struct PoolState {
    free: VecDeque<Arc<WorkerHandle>>,
    busy: HashMap<WorkerId, Arc<WorkerHandle>>,
    /// free + busy + spawning
    live: usize,
    spawning: usize,
    draining: bool,
    /// Workers returned while draining, stopped by `shutdown`
    retired: Vec<Arc<WorkerHandle>>,
}

struct PoolInner {
    settings: PoolSettings,
    worker_settings: Arc<WorkerSettings>,
    state: Mutex<PoolState>,
    permits: Arc<Semaphore>,
    available: Notify,
    waiters: AtomicUsize,
    exit_tx: mpsc::UnboundedSender<WorkerId>,
    metrics: Arc<BridgeMetrics>,
}

enum Step {
    Leased(Arc<WorkerHandle>),
    Spawn,
    Wait,
}

/// Where a specific worker stands for a targeted checkout
enum Target {
    Leased(WorkerLease),
    Free,
    Busy,
    Gone,
}

/// Counts a caller as waiting for the lifetime of its checkout
struct WaitGuard<'a>(&'a AtomicUsize);

impl<'a> WaitGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// === Worker Lease ===

/// Exclusive use of one worker; checks the worker back in on drop
pub struct WorkerLease {
    worker: Arc<WorkerHandle>,
    session: Option<String>,
    inner: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker", &self.worker.id())
            .field("session", &self.session)
            .finish()
    }
}

impl WorkerLease {
    /// The leased worker
    #[must_use]
    pub const fn worker(&self) -> &Arc<WorkerHandle> {
        &self.worker
    }

    /// Id of the leased worker
    #[must_use]
    pub fn worker_id(&self) -> WorkerId {
        self.worker.id()
    }

    /// Session this lease serves, recorded as affinity on checkin
    #[must_use]
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Send a command with the pool's operation timeout
    pub async fn send(&self, command: &str, args: &Value) -> BridgeResult<Value> {
        self.worker
            .send_and_await(command, args, self.inner.settings.operation_timeout)
            .await
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.inner.checkin(&self.worker, self.session.take());
    }
}

// === Worker Pool ===

/// Pool of warm worker subprocesses
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    exit_listener: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Create the pool and, unless lazy, spawn `size` workers
    ///
    /// Fails if eager startup cannot bring up a single worker. A partial start
    /// is logged and left to the health sweep to fill up.
    pub async fn start(config: &BridgeConfig, metrics: Arc<BridgeMetrics>) -> BridgeResult<Self> {
        let settings = PoolSettings::from_config(config);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(PoolInner {
            permits: Arc::new(Semaphore::new(settings.capacity())),
            settings,
            worker_settings: Arc::new(WorkerSettings::from_config(config)),
            state: Mutex::new(PoolState::default()),
            available: Notify::new(),
            waiters: AtomicUsize::new(0),
            exit_tx,
            metrics,
        });

        let listener = PoolInner::start_exit_listener(&inner, exit_rx);
        let pool = Self {
            inner,
            exit_listener: Mutex::new(Some(listener)),
        };

        if !pool.inner.settings.lazy {
            pool.fill_eagerly().await?;
        }

        info!(
            size = pool.inner.settings.size,
            max_overflow = pool.inner.settings.max_overflow,
            lazy = pool.inner.settings.lazy,
            "Worker pool started"
        );
        Ok(pool)
    }

    async fn fill_eagerly(&self) -> BridgeResult<()> {
        let inner = &self.inner;
        let size = inner.settings.size;
        {
            let mut state = inner.lock();
            state.live += size;
            state.spawning += size;
        }

        let results = join_all((0..size).map(|_| inner.spawn_worker())).await;

        let mut first_error = None;
        let started = {
            let mut state = inner.lock();
            state.spawning -= size;
            for result in results {
                match result {
                    Ok(worker) => state.free.push_back(worker),
                    Err(err) => {
                        state.live -= 1;
                        first_error.get_or_insert(err);
                    }
                }
            }
            state.free.len()
        };

        match first_error {
            Some(err) if started == 0 => {
                self.abort_listener();
                Err(err)
            }
            Some(err) => {
                warn!(started, target = size, error = %err, "Pool started below target size");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Pool parameters
    #[must_use]
    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Whether shutdown has started
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.inner.lock().draining
    }

    /// Lease a worker, preferring the one that last served `session`
    ///
    /// Creates an overflow worker when none is free and the pool is below its
    /// ceiling; otherwise waits for a checkin. Fails with `checkout_timeout`
    /// once `timeout` elapses and `pool_not_available` while draining.
    pub async fn checkout(
        &self,
        session: Option<&str>,
        timeout: Duration,
    ) -> BridgeResult<WorkerLease> {
        let inner = &self.inner;
        let started = Instant::now();
        let deadline = started + timeout;
        let _waiting = WaitGuard::new(&inner.waiters);

        let permit = inner.acquire_permit(started, deadline, timeout).await?;

        loop {
            let notified = inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (step, dead, replacements) = {
                let mut state = inner.lock();
                if state.draining {
                    return Err(not_available());
                }
                let mut dead = Vec::new();
                let step = if let Some(worker) = take_free(&mut state, session, &mut dead) {
                    state.busy.insert(worker.id(), Arc::clone(&worker));
                    Step::Leased(worker)
                } else if state.live < inner.settings.capacity() {
                    state.live += 1;
                    state.spawning += 1;
                    Step::Spawn
                } else {
                    Step::Wait
                };
                let replacements = inner.reserve_replacements(&mut state);
                (step, dead, replacements)
            };
            inner.discard(dead);
            inner.spawn_replacements(replacements);

            match step {
                Step::Leased(worker) => {
                    debug!(worker_id = %worker.id(), session = ?session, "Worker checked out");
                    return Ok(inner.lease(worker, session, permit));
                }
                Step::Spawn => {
                    return inner
                        .checkout_fresh(session, permit, started, deadline, timeout)
                        .await;
                }
                Step::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(checkout_timeout(started, timeout));
                    }
                }
            }
        }
    }

    /// Lease one specific worker
    ///
    /// Waits while that worker is busy without holding a capacity slot, so
    /// other callers keep getting free workers. Returns `None` when the worker
    /// no longer exists.
    pub async fn checkout_worker(
        &self,
        worker_id: WorkerId,
        timeout: Duration,
    ) -> BridgeResult<Option<WorkerLease>> {
        let inner = &self.inner;
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let notified = inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match inner.find_worker(worker_id, None)? {
                Target::Gone => return Ok(None),
                Target::Leased(lease) => return Ok(Some(lease)),
                Target::Busy => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(checkout_timeout(started, timeout));
                    }
                }
                Target::Free => {
                    let permit = {
                        let _waiting = WaitGuard::new(&inner.waiters);
                        inner.acquire_permit(started, deadline, timeout).await?
                    };
                    // Another caller may have taken the worker while we queued
                    match inner.find_worker(worker_id, Some(permit))? {
                        Target::Leased(lease) => return Ok(Some(lease)),
                        Target::Gone => return Ok(None),
                        Target::Busy | Target::Free => {}
                    }
                }
            }
        }
    }

    /// Return a lease explicitly; dropping it does the same
    pub fn checkin(&self, lease: WorkerLease) {
        drop(lease);
    }

    /// Check out, run `f` with the worker in the caller's task, check in
    pub async fn with_worker<T, F, Fut>(
        &self,
        session: Option<&str>,
        timeout: Duration,
        f: F,
    ) -> BridgeResult<T>
    where
        F: FnOnce(Arc<WorkerHandle>) -> Fut,
        Fut: Future<Output = BridgeResult<T>>,
    {
        let lease = self.checkout(session, timeout).await?;
        let result = f(Arc::clone(lease.worker())).await;
        self.checkin(lease);
        result
    }

    /// Best-effort `cleanup_session` on the worker that served a session
    pub async fn dispatch_cleanup(&self, hint: &CleanupHint) -> CleanupOutcome {
        let Some(worker_id) = hint.worker_id else {
            return CleanupOutcome::NoWorker;
        };

        let timeout = self.inner.settings.checkout_timeout;
        let outcome = match self.checkout_worker(worker_id, timeout).await {
            Ok(Some(lease)) => {
                let args = json!({ "session_id": hint.session_id });
                match lease.send("cleanup_session", &args).await {
                    Ok(_) => CleanupOutcome::Cleaned,
                    Err(err) => CleanupOutcome::Failed(err.to_string()),
                }
            }
            Ok(None) => CleanupOutcome::WorkerGone,
            Err(err) => CleanupOutcome::Failed(err.to_string()),
        };

        match &outcome {
            CleanupOutcome::Cleaned => {
                debug!(session = %hint.session_id, worker_id = %worker_id, "Session cleaned up");
                self.inner.metrics.cleanup_dispatched(true);
            }
            CleanupOutcome::Failed(reason) => {
                warn!(session = %hint.session_id, worker_id = %worker_id, reason = %reason, "Session cleanup failed");
                self.inner.metrics.cleanup_dispatched(false);
            }
            CleanupOutcome::WorkerGone | CleanupOutcome::NoWorker => {
                debug!(session = %hint.session_id, "Session worker gone, nothing to clean");
            }
        }
        outcome
    }

    /// Probe idle workers, evict failures and refill to target size
    ///
    /// Idle workers are parked in the busy set while probed so no caller can
    /// lease them mid-ping. Leased workers are skipped.
    pub async fn health_sweep(&self) -> SweepReport {
        let inner = &self.inner;
        let (candidates, leased) = {
            let mut state = inner.lock();
            if state.draining {
                (Vec::new(), Vec::new())
            } else {
                let candidates: Vec<Arc<WorkerHandle>> = state.free.drain(..).collect();
                let leased: Vec<Arc<WorkerHandle>> = state.busy.values().cloned().collect();
                for worker in &candidates {
                    state.busy.insert(worker.id(), Arc::clone(worker));
                }
                (candidates, leased)
            }
        };

        let probes = join_all(candidates.iter().map(|w| w.health_check())).await;

        let mut checks = Vec::with_capacity(candidates.len() + leased.len());
        let mut failed = Vec::new();
        let replacements = {
            let mut state = inner.lock();
            for (worker, probe) in candidates.into_iter().zip(probes) {
                checks.push(WorkerCheck {
                    worker_id: worker.id(),
                    probe: probe.clone(),
                });
                if state.busy.remove(&worker.id()).is_none() {
                    continue;
                }
                let passed = !matches!(probe, HealthProbe::Failed(_)) && worker.is_available();
                if state.draining {
                    state.live -= 1;
                    state.retired.push(worker);
                } else if passed {
                    state.free.push_back(worker);
                } else {
                    state.live -= 1;
                    failed.push(worker);
                }
            }
            for worker in leased {
                let probe = if worker.is_alive() {
                    HealthProbe::Skipped
                } else {
                    HealthProbe::Failed("process exited".to_string())
                };
                checks.push(WorkerCheck {
                    worker_id: worker.id(),
                    probe,
                });
            }
            inner.reserve_replacements(&mut state)
        };

        inner.available.notify_waiters();
        for worker in &failed {
            warn!(worker_id = %worker.id(), health = worker.health().as_str(), "Worker failed health check");
        }
        inner.discard(failed);
        inner.spawn_replacements(replacements);
        inner.metrics.health_checked();

        SweepReport {
            checks,
            replacements,
            status: self.status(),
        }
    }

    /// Point-in-time status
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let inner = &self.inner;
        let state = inner.lock();
        let mut workers: Vec<WorkerSnapshot> = state
            .free
            .iter()
            .chain(state.busy.values())
            .map(|w| w.snapshot())
            .collect();
        workers.sort_by_key(|w| w.worker_id);

        let running = state.free.len() + state.busy.len();
        PoolStatus {
            size: inner.settings.size,
            max_overflow: inner.settings.max_overflow,
            live_workers: state.live,
            free_workers: state.free.len(),
            busy_workers: state.busy.len(),
            spawning: state.spawning,
            overflow_in_use: running.saturating_sub(inner.settings.size),
            waiting: inner.waiters.load(Ordering::SeqCst),
            draining: state.draining,
            workers,
        }
    }

    /// Stop accepting checkouts, wait up to `timeout` for leases to return,
    /// then kill whatever is still out
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let inner = &self.inner;
        let deadline = Instant::now() + timeout;

        let (idle, in_flight) = {
            let mut state = inner.lock();
            state.draining = true;
            let idle: Vec<Arc<WorkerHandle>> = state.free.drain(..).collect();
            state.live -= idle.len();
            (idle, state.busy.len())
        };
        inner.permits.close();
        inner.available.notify_waiters();
        info!(idle = idle.len(), in_flight, "Draining worker pool");

        join_all(idle.iter().map(|w| w.terminate())).await;

        let timed_out = loop {
            let notified = inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = inner.lock();
                if state.busy.is_empty() && state.spawning == 0 {
                    break false;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break true;
            }
        };

        let (forced, retired) = {
            let mut state = inner.lock();
            let forced: Vec<Arc<WorkerHandle>> = state.busy.drain().map(|(_, w)| w).collect();
            state.live -= forced.len();
            (forced, std::mem::take(&mut state.retired))
        };
        for worker in &forced {
            warn!(worker_id = %worker.id(), "Killing worker still leased at shutdown");
            worker.kill();
        }
        join_all(retired.iter().map(|w| w.terminate())).await;

        self.abort_listener();
        let report = ShutdownReport {
            idle_terminated: idle.len(),
            drained: retired.len(),
            forced: forced.len(),
            timed_out,
        };
        info!(?report, "Worker pool stopped");
        report
    }

    fn abort_listener(&self) {
        let handle = self
            .exit_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.abort_listener();
    }
}

// === Pool Internals ===

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_exit_listener(
        inner: &Arc<Self>,
        mut exit_rx: mpsc::UnboundedReceiver<WorkerId>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            while let Some(worker_id) = exit_rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_exit(worker_id);
            }
        })
    }

    fn lease(
        self: &Arc<Self>,
        worker: Arc<WorkerHandle>,
        session: Option<&str>,
        permit: OwnedSemaphorePermit,
    ) -> WorkerLease {
        WorkerLease {
            worker,
            session: session.map(str::to_string),
            inner: Arc::clone(self),
            _permit: permit,
        }
    }

    /// Locate one worker; with a permit in hand, lease it if it is free
    fn find_worker(
        self: &Arc<Self>,
        worker_id: WorkerId,
        permit: Option<OwnedSemaphorePermit>,
    ) -> BridgeResult<Target> {
        let (target, dead, replacements) = {
            let mut state = self.lock();
            if state.draining {
                return Err(not_available());
            }
            let mut dead = Vec::new();
            let target = match state.free.iter().position(|w| w.id() == worker_id) {
                Some(pos) if !state.free[pos].is_available() => {
                    if let Some(worker) = state.free.remove(pos) {
                        state.live -= 1;
                        dead.push(worker);
                    }
                    Target::Gone
                }
                Some(pos) => match permit {
                    Some(permit) => match state.free.remove(pos) {
                        Some(worker) => {
                            state.busy.insert(worker_id, Arc::clone(&worker));
                            Target::Leased(self.lease(worker, None, permit))
                        }
                        None => Target::Gone,
                    },
                    None => Target::Free,
                },
                None if state.busy.contains_key(&worker_id) => Target::Busy,
                None => Target::Gone,
            };
            let replacements = self.reserve_replacements(&mut state);
            (target, dead, replacements)
        };
        self.discard(dead);
        self.spawn_replacements(replacements);
        Ok(target)
    }

    async fn acquire_permit(
        &self,
        started: Instant,
        deadline: Instant,
        timeout: Duration,
    ) -> BridgeResult<OwnedSemaphorePermit> {
        match tokio::time::timeout_at(deadline, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(not_available()),
            Err(_) => Err(checkout_timeout(started, timeout)),
        }
    }

    async fn spawn_worker(&self) -> BridgeResult<Arc<WorkerHandle>> {
        let spawned =
            WorkerHandle::spawn(Arc::clone(&self.worker_settings), Some(self.exit_tx.clone()))
                .await;
        match &spawned {
            Ok(_) => self.metrics.worker_spawned(),
            Err(_) => self.metrics.spawn_failed(),
        }
        spawned
    }

    /// Spawn a worker for a caller that found the pool empty but below ceiling
    async fn checkout_fresh(
        self: &Arc<Self>,
        session: Option<&str>,
        permit: OwnedSemaphorePermit,
        started: Instant,
        deadline: Instant,
        timeout: Duration,
    ) -> BridgeResult<WorkerLease> {
        let spawned = tokio::time::timeout_at(deadline, self.spawn_worker()).await;

        let outcome = {
            let mut state = self.lock();
            state.spawning -= 1;
            match spawned {
                Ok(Ok(worker)) if state.draining => {
                    state.live -= 1;
                    worker.kill();
                    Err(not_available())
                }
                Ok(Ok(worker)) => {
                    state.busy.insert(worker.id(), Arc::clone(&worker));
                    Ok(worker)
                }
                Ok(Err(err)) => {
                    state.live -= 1;
                    Err(err)
                }
                Err(_) => {
                    state.live -= 1;
                    Err(checkout_timeout(started, timeout))
                }
            }
        };

        match outcome {
            Ok(worker) => {
                debug!(worker_id = %worker.id(), "Spawned worker on demand");
                Ok(self.lease(worker, session, permit))
            }
            Err(err) => {
                self.available.notify_waiters();
                Err(err)
            }
        }
    }

    fn checkin(self: &Arc<Self>, worker: &Arc<WorkerHandle>, session: Option<String>) {
        let worker_id = worker.id();
        let (discard, replacements) = {
            let mut state = self.lock();
            if state.busy.remove(&worker_id).is_none() {
                // Already reclaimed by a forced shutdown
                return;
            }

            if worker.is_available() {
                if session.is_some() {
                    worker.set_bound_session(session);
                }
                if state.draining {
                    state.live -= 1;
                    state.retired.push(Arc::clone(worker));
                    (None, 0)
                } else if state.live > self.settings.size
                    && self.waiters.load(Ordering::SeqCst) == 0
                {
                    state.live -= 1;
                    debug!(worker_id = %worker_id, "Retiring overflow worker");
                    (Some(Arc::clone(worker)), 0)
                } else {
                    state.free.push_back(Arc::clone(worker));
                    (None, 0)
                }
            } else {
                state.live -= 1;
                warn!(worker_id = %worker_id, health = worker.health().as_str(), "Evicting worker on checkin");
                let replacements = self.reserve_replacements(&mut state);
                (Some(Arc::clone(worker)), replacements)
            }
        };

        self.available.notify_waiters();
        if let Some(worker) = discard {
            self.discard(vec![worker]);
        }
        self.spawn_replacements(replacements);
    }

    fn handle_exit(self: &Arc<Self>, worker_id: WorkerId) {
        let (dead, replacements) = {
            let mut state = self.lock();
            let dead = state
                .free
                .iter()
                .position(|w| w.id() == worker_id)
                .and_then(|pos| state.free.remove(pos));
            if dead.is_some() {
                state.live -= 1;
            }
            (dead, self.reserve_replacements(&mut state))
        };

        if let Some(worker) = dead {
            warn!(worker_id = %worker_id, "Idle worker exited, replacing");
            self.discard(vec![worker]);
            self.available.notify_waiters();
        }
        self.spawn_replacements(replacements);
    }

    /// Reserve slots for the workers missing from target size
    ///
    /// Lazy pools only grow through checkout.
    fn reserve_replacements(&self, state: &mut PoolState) -> usize {
        if state.draining || self.settings.lazy {
            return 0;
        }
        let missing = self.settings.size.saturating_sub(state.live);
        state.live += missing;
        state.spawning += missing;
        missing
    }

    fn spawn_replacements(self: &Arc<Self>, count: usize) {
        for _ in 0..count {
            let inner = Arc::clone(self);
            if !spawn_background(inner.replace_one()) {
                let mut state = self.lock();
                state.live -= 1;
                state.spawning -= 1;
            }
        }
    }

    async fn replace_one(self: Arc<Self>) {
        let mut backoff =
            ExponentialBackoff::new(self.settings.respawn_backoff_base, self.settings.respawn_backoff_max);

        for attempt in 1..=REPLACEMENT_ATTEMPTS {
            if self.lock().draining {
                break;
            }
            match self.spawn_worker().await {
                Ok(worker) => {
                    let accepted = {
                        let mut state = self.lock();
                        state.spawning -= 1;
                        if state.draining {
                            state.live -= 1;
                            false
                        } else {
                            state.free.push_back(Arc::clone(&worker));
                            true
                        }
                    };
                    if accepted {
                        self.metrics.worker_replaced();
                        info!(worker_id = %worker.id(), "Replacement worker ready");
                    } else {
                        worker.kill();
                    }
                    self.available.notify_waiters();
                    return;
                }
                Err(err) => {
                    warn!(attempt, error = %err, "Replacement worker failed to start");
                    if attempt < REPLACEMENT_ATTEMPTS {
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                }
            }
        }

        {
            let mut state = self.lock();
            state.spawning -= 1;
            state.live -= 1;
        }
        error!("Worker replacement abandoned until the next health sweep");
        self.available.notify_waiters();
    }

    /// Stop workers that left circulation, in the background
    fn discard(&self, workers: Vec<Arc<WorkerHandle>>) {
        for worker in workers {
            let stopping = Arc::clone(&worker);
            let spawned = spawn_background(async move {
                stopping.terminate().await;
            });
            if !spawned {
                worker.kill();
            }
        }
    }
}

/// Take a free worker, preferring the session's previous worker; dead
/// entries found on the way are moved into `dead`
fn take_free(
    state: &mut PoolState,
    session: Option<&str>,
    dead: &mut Vec<Arc<WorkerHandle>>,
) -> Option<Arc<WorkerHandle>> {
    let before = dead.len();
    state.free.retain(|w| {
        if w.is_available() {
            true
        } else {
            dead.push(Arc::clone(w));
            false
        }
    });
    state.live -= dead.len() - before;

    let preferred = session.and_then(|s| {
        state
            .free
            .iter()
            .position(|w| w.bound_session().as_deref() == Some(s))
    });
    match preferred {
        Some(pos) => state.free.remove(pos),
        None => state.free.pop_front(),
    }
}

fn spawn_background<F>(future: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
            true
        }
        Err(_) => false,
    }
}

fn checkout_timeout(started: Instant, timeout: Duration) -> BridgeError {
    BridgeError::CheckoutTimeout {
        waited: started.elapsed(),
        timeout,
    }
}

fn not_available() -> BridgeError {
    BridgeError::PoolNotAvailable {
        reason: "pool is shutting down".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(command: &str) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.worker.command = command.to_string();
        config.worker.init_timeout = Duration::from_millis(500);
        config.pool.size = 2;
        config.pool.max_overflow = 1;
        config.pool.checkout_timeout = Duration::from_millis(300);
        config
    }

    #[test]
    fn test_settings_from_config() {
        let settings = PoolSettings::from_config(&config("w"));
        assert_eq!(settings.size, 2);
        assert_eq!(settings.capacity(), 3);
        assert!(!settings.lazy);
    }

    #[tokio::test]
    async fn test_eager_start_fails_without_any_worker() {
        let metrics = Arc::new(BridgeMetrics::new());
        let err = WorkerPool::start(&config("/nonexistent/worker"), Arc::clone(&metrics))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "worker_start_failed");
        assert_eq!(BridgeMetrics::load(&metrics.spawn_failures), 2);
    }

    #[tokio::test]
    async fn test_lazy_pool_starts_empty() {
        let mut config = config("true");
        config.pool.lazy = true;
        let pool = WorkerPool::start(&config, Arc::new(BridgeMetrics::new()))
            .await
            .unwrap();

        let status = pool.status();
        assert_eq!(status.live_workers, 0);
        assert_eq!(status.free_workers, 0);
        assert!(!status.draining);
    }

    #[tokio::test]
    async fn test_on_demand_spawn_failure_releases_slot() {
        let mut config = config("true");
        config.pool.lazy = true;
        let pool = WorkerPool::start(&config, Arc::new(BridgeMetrics::new()))
            .await
            .unwrap();

        let err = pool
            .checkout(None, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "worker_start_failed");
        assert_eq!(pool.status().live_workers, 0);
        assert_eq!(pool.status().waiting, 0);
    }

    #[tokio::test]
    async fn test_checkout_after_shutdown_is_rejected() {
        let mut config = config("true");
        config.pool.lazy = true;
        let pool = WorkerPool::start(&config, Arc::new(BridgeMetrics::new()))
            .await
            .unwrap();

        let report = pool.shutdown(Duration::from_millis(100)).await;
        assert_eq!(report, ShutdownReport::default());
        assert!(pool.is_draining());

        let err = pool
            .checkout(None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "pool_not_available");
    }

    #[tokio::test]
    async fn test_cleanup_without_worker_is_noop() {
        let mut config = config("true");
        config.pool.lazy = true;
        let pool = WorkerPool::start(&config, Arc::new(BridgeMetrics::new()))
            .await
            .unwrap();

        let hint = CleanupHint {
            session_id: "s1".to_string(),
            worker_id: None,
        };
        assert_eq!(pool.dispatch_cleanup(&hint).await, CleanupOutcome::NoWorker);

        let hint = CleanupHint {
            session_id: "s1".to_string(),
            worker_id: Some(WorkerId::from_raw(u64::MAX)),
        };
        assert_eq!(pool.dispatch_cleanup(&hint).await, CleanupOutcome::WorkerGone);
    }
}
