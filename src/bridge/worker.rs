// ABOUTME: Worker handle owning one subprocess, its pipes, health and stats
//
// State machine: starting -> ready -> busy -> ready (loop) | unhealthy -> terminated
//
// A handle is only handed out after the readiness handshake (a `ping` answered
// within the init timeout). The exit watcher flips the handle to `terminated`
// the moment the process dies, whatever is in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use tokio::io::BufReader;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::codec::{self, CodecError, ResponseStatus};
use super::config::BridgeConfig;
use super::error::{BridgeError, BridgeResult};
use super::process::{spawn_process, LaunchSpec, ProcessMonitor, ProcessState};

/// How long to wait for an exit notification after the stream drops
const EXIT_SETTLE: Duration = Duration::from_millis(500);

/// Upper bound for the courtesy `shutdown` command sent before signalling
const SHUTDOWN_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

// === Worker ID ===

/// Unique identifier for a worker, stable for the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    /// Allocate the next id from the process-wide counter
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw id
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric id
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

impl Serialize for WorkerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// === Worker Health ===

/// Health of a worker handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    /// Spawned, handshake in progress
    Starting,
    /// Idle and proven to answer
    Ready,
    /// Serving exactly one request
    Busy,
    /// Must not be reused; awaiting replacement
    Unhealthy,
    /// Process has exited
    Terminated,
}

impl WorkerHealth {
    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Unhealthy => "unhealthy",
            Self::Terminated => "terminated",
        }
    }

    /// Whether a worker in this state may go back into circulation
    #[must_use]
    pub const fn is_reusable(self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }
}

/// Outcome of a single health probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthProbe {
    /// Ping answered in time
    Healthy,
    /// Worker was busy; trusted from its last successful exchange
    Skipped,
    /// Ping failed or the worker is already unusable
    Failed(String),
}

// === Worker Settings ===

/// Launch and protocol settings shared by every worker of a pool
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Executable to spawn
    pub command: String,
    /// Base arguments
    pub args: Vec<String>,
    /// Extra environment
    pub env: Vec<(String, String)>,
    /// Working directory
    pub cwd: Option<std::path::PathBuf>,
    /// Readiness handshake deadline
    pub init_timeout: Duration,
    /// SIGTERM to SIGKILL grace period
    pub terminate_grace: Duration,
    /// Ping deadline for health probes
    pub health_check_timeout: Duration,
    /// Frame payload limit
    pub max_payload_bytes: usize,
}

impl WorkerSettings {
    /// Derive worker settings from the bridge configuration
    #[must_use]
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            command: config.worker.command.clone(),
            args: config.worker.args.clone(),
            env: config
                .worker
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            cwd: config.worker.cwd.clone(),
            init_timeout: config.worker.init_timeout,
            terminate_grace: config.worker.terminate_grace,
            health_check_timeout: config.pool.health_check_timeout,
            max_payload_bytes: config.pool.max_payload_bytes,
        }
    }

    /// Launch spec for one worker; the worker learns its own id via `--worker-id`
    fn launch_spec(&self, id: WorkerId) -> LaunchSpec {
        let mut args = self.args.clone();
        args.extend([
            "--worker-id".to_string(),
            id.to_string(),
            "--mode".to_string(),
            "pool-worker".to_string(),
        ]);
        LaunchSpec {
            command: self.command.clone(),
            args,
            env: self.env.clone(),
            cwd: self.cwd.clone(),
        }
    }
}

// === Worker Snapshot ===

/// Point-in-time view of one worker for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    /// Worker id
    pub worker_id: WorkerId,
    /// OS process id
    pub pid: u32,
    /// Current health
    pub health: WorkerHealth,
    /// Last session served (affinity hint)
    pub bound_session: Option<String>,
    /// Requests answered (ok or error)
    pub requests_served: u64,
    /// Failed requests
    pub errors: u64,
    /// Last exchange time
    pub last_activity: DateTime<Utc>,
}

// === Worker Handle ===

struct WorkerIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Owns one worker subprocess and its communication channel
pub struct WorkerHandle {
    id: WorkerId,
    pid: u32,
    settings: Arc<WorkerSettings>,
    health: Mutex<WorkerHealth>,
    io: tokio::sync::Mutex<WorkerIo>,
    bound_session: Mutex<Option<String>>,
    next_request_id: AtomicU64,
    requests_served: AtomicU64,
    errors: AtomicU64,
    last_activity: Mutex<DateTime<Utc>>,
    last_success: Mutex<Instant>,
    monitor: ProcessMonitor,
    exit_rx: watch::Receiver<ProcessState>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("health", &self.health())
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    /// Spawn a worker and complete its readiness handshake
    ///
    /// `exit_tx` receives this worker's id when its process exits.
    /// Fails with `worker_start_failed` if the process cannot be launched or
    /// does not answer `ping` within the init timeout.
    pub async fn spawn(
        settings: Arc<WorkerSettings>,
        exit_tx: Option<mpsc::UnboundedSender<WorkerId>>,
    ) -> BridgeResult<Arc<Self>> {
        let id = WorkerId::next();
        let spawned = spawn_process(&settings.launch_spec(id)).map_err(|e| {
            BridgeError::WorkerStartFailed {
                reason: e.to_string(),
            }
        })?;

        let exit_rx = spawned.monitor.subscribe();
        let handle = Arc::new(Self {
            id,
            pid: spawned.pid,
            settings: Arc::clone(&settings),
            health: Mutex::new(WorkerHealth::Starting),
            io: tokio::sync::Mutex::new(WorkerIo {
                stdin: spawned.stdin,
                stdout: BufReader::new(spawned.stdout),
            }),
            bound_session: Mutex::new(None),
            next_request_id: AtomicU64::new(1),
            requests_served: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_activity: Mutex::new(Utc::now()),
            last_success: Mutex::new(Instant::now()),
            monitor: spawned.monitor,
            exit_rx: exit_rx.clone(),
        });

        Self::start_exit_watcher(&handle, exit_rx, exit_tx);

        match handle.handshake().await {
            Ok(()) => {
                handle.set_health(WorkerHealth::Ready);
                info!(worker_id = %id, pid = handle.pid, "Worker ready");
                Ok(handle)
            }
            Err(reason) => {
                warn!(worker_id = %id, reason = %reason, "Worker failed readiness handshake");
                handle.monitor.force_kill();
                handle.set_health(WorkerHealth::Terminated);
                Err(BridgeError::WorkerStartFailed { reason })
            }
        }
    }

    fn start_exit_watcher(
        handle: &Arc<Self>,
        mut exit_rx: watch::Receiver<ProcessState>,
        exit_tx: Option<mpsc::UnboundedSender<WorkerId>>,
    ) {
        let weak = Arc::downgrade(handle);
        let id = handle.id;
        tokio::spawn(async move {
            let state = match exit_rx.wait_for(|s| !s.is_running()).await {
                Ok(state) => state.clone(),
                Err(_) => return,
            };
            if let Some(handle) = weak.upgrade() {
                let previous = handle.health();
                handle.set_health(WorkerHealth::Terminated);
                if previous != WorkerHealth::Terminated {
                    info!(worker_id = %id, exit = %state, previous = previous.as_str(), "Worker process exited");
                }
            }
            if let Some(tx) = exit_tx {
                let _ = tx.send(id);
            }
        });
    }

    async fn handshake(&self) -> Result<(), String> {
        let timeout = self.settings.init_timeout;
        let frame = self
            .encode("ping", &json!({}))
            .map_err(|e| e.to_string())?;

        let exchange = self.exchange_with_exit(&frame.0, frame.1, "ping");
        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(response)) if response.status == ResponseStatus::Ok => {
                self.record_success();
                Ok(())
            }
            Ok(Ok(response)) => Err(format!(
                "ping answered with error: {}",
                codec::Response::error_message(&response.payload)
            )),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("no ping response within {timeout:?}")),
        }
    }

    // === Accessors ===

    /// Worker id
    #[must_use]
    pub const fn id(&self) -> WorkerId {
        self.id
    }

    /// OS process id
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Current health
    #[must_use]
    pub fn health(&self) -> WorkerHealth {
        *self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set health; `terminated` is final
    pub(crate) fn set_health(&self, health: WorkerHealth) {
        let mut current = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != WorkerHealth::Terminated {
            *current = health;
        }
    }

    /// Mark this worker unusable until replaced
    pub fn mark_unhealthy(&self) {
        self.set_health(WorkerHealth::Unhealthy);
    }

    /// Whether the process is still running
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.monitor.is_running()
    }

    /// Whether the worker may be handed to a caller
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.is_alive() && self.health().is_reusable()
    }

    /// Last session this worker served
    #[must_use]
    pub fn bound_session(&self) -> Option<String> {
        self.bound_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record the session just served (affinity hint)
    pub fn set_bound_session(&self, session: Option<String>) {
        *self
            .bound_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = session;
    }

    /// Time since the last successful exchange
    #[must_use]
    pub fn since_last_success(&self) -> Duration {
        self.last_success
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Snapshot for status reporting
    #[must_use]
    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            worker_id: self.id,
            pid: self.pid,
            health: self.health(),
            bound_session: self.bound_session(),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_activity: *self
                .last_activity
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    // === Request/Response ===

    /// Send one command and wait for its response
    ///
    /// Frames with a foreign correlation id are drained and discarded. On
    /// timeout the worker is marked unhealthy since it may still be mid-write.
    pub async fn send_and_await(
        &self,
        command: &str,
        args: &Value,
        timeout: Duration,
    ) -> BridgeResult<Value> {
        match self.health() {
            WorkerHealth::Terminated => {
                return Err(BridgeError::WorkerTerminated {
                    worker_id: self.id,
                    exit: self.monitor.state().to_string(),
                })
            }
            WorkerHealth::Unhealthy => {
                return Err(BridgeError::StreamClosed {
                    worker_id: self.id,
                    reason: "worker is marked unhealthy".to_string(),
                })
            }
            _ => {}
        }

        // Oversized arguments are rejected before anything touches the pipe
        let (frame, request_id) = self.encode(command, args)?;

        self.set_health(WorkerHealth::Busy);
        debug!(worker_id = %self.id, request_id, command = %command, "Sending request");

        let result = match tokio::time::timeout(
            timeout,
            self.exchange_with_exit(&frame, request_id, command),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BridgeError::OperationTimeout {
                worker_id: self.id,
                command: command.to_string(),
                timeout,
            }),
        };

        self.touch();
        match result {
            Ok(response) => {
                self.requests_served.fetch_add(1, Ordering::Relaxed);
                self.set_health(WorkerHealth::Ready);
                match response.into_result() {
                    Ok(value) => {
                        self.record_success();
                        Ok(value)
                    }
                    Err(details) => {
                        self.errors.fetch_add(1, Ordering::Relaxed);
                        Err(BridgeError::CommandFailed {
                            worker_id: self.id,
                            command: command.to_string(),
                            message: codec::Response::error_message(&details),
                            details,
                        })
                    }
                }
            }
            Err(err) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                if matches!(err, BridgeError::WorkerTerminated { .. }) {
                    self.set_health(WorkerHealth::Terminated);
                } else {
                    warn!(worker_id = %self.id, command = %command, error = %err, "Worker marked unhealthy");
                    self.set_health(WorkerHealth::Unhealthy);
                }
                Err(err)
            }
        }
    }

    /// Probe liveness with a short ping
    ///
    /// Busy workers are skipped; their last exchange vouches for them.
    pub async fn health_check(&self) -> HealthProbe {
        match self.health() {
            WorkerHealth::Busy | WorkerHealth::Starting => return HealthProbe::Skipped,
            WorkerHealth::Unhealthy => return HealthProbe::Failed("marked unhealthy".to_string()),
            WorkerHealth::Terminated => {
                return HealthProbe::Failed(format!("terminated ({})", self.monitor.state()))
            }
            WorkerHealth::Ready => {}
        }

        let timeout = self.settings.health_check_timeout;
        match self.send_and_await("ping", &json!({}), timeout).await {
            Ok(_) => HealthProbe::Healthy,
            Err(e) => HealthProbe::Failed(e.to_string()),
        }
    }

    /// Stop the worker: courtesy `shutdown` if idle, then SIGTERM, then SIGKILL
    pub async fn terminate(&self) -> ProcessState {
        if self.health() == WorkerHealth::Ready {
            if let Ok((frame, request_id)) = self.encode("shutdown", &json!({})) {
                let wait = SHUTDOWN_COMMAND_TIMEOUT.min(self.settings.terminate_grace);
                let courtesy = async {
                    if self
                        .exchange_with_exit(&frame, request_id, "shutdown")
                        .await
                        .is_ok()
                    {
                        self.monitor.wait().await;
                    }
                };
                let _ = tokio::time::timeout(wait, courtesy).await;
            }
        }

        self.set_health(WorkerHealth::Terminated);
        self.monitor.terminate(self.settings.terminate_grace).await
    }

    /// SIGKILL without ceremony
    pub fn kill(&self) {
        self.set_health(WorkerHealth::Terminated);
        self.monitor.force_kill();
    }

    // === Internals ===

    fn encode(&self, command: &str, args: &Value) -> BridgeResult<(Vec<u8>, u64)> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let frame =
            codec::encode_request(request_id, command, args, self.settings.max_payload_bytes)?;
        Ok((frame, request_id))
    }

    /// Exchange one frame, racing the process exit notification
    async fn exchange_with_exit(
        &self,
        frame: &[u8],
        request_id: u64,
        command: &str,
    ) -> BridgeResult<codec::Response> {
        let mut exit_rx = self.exit_rx.clone();
        tokio::select! {
            result = self.exchange(frame, request_id, command) => result,
            exited = exit_rx.wait_for(|s| !s.is_running()) => {
                let exit = exited.map_or_else(|_| "unknown".to_string(), |s| s.to_string());
                Err(BridgeError::WorkerTerminated { worker_id: self.id, exit })
            }
        }
    }

    async fn exchange(
        &self,
        frame: &[u8],
        request_id: u64,
        command: &str,
    ) -> BridgeResult<codec::Response> {
        let mut io = self.io.lock().await;
        let max = self.settings.max_payload_bytes;

        if let Err(e) = codec::write_frame(&mut io.stdin, frame).await {
            return Err(self.stream_failure(e).await);
        }

        loop {
            let payload = match codec::read_frame(&mut io.stdout, max).await {
                Ok(payload) => payload,
                Err(e) => return Err(self.stream_failure(e).await),
            };
            let response = codec::parse_response(&payload)?;
            if response.id == request_id {
                return Ok(response);
            }
            warn!(
                worker_id = %self.id,
                expected = request_id,
                received = response.id,
                command = %command,
                "Discarding stale response frame"
            );
        }
    }

    /// Classify a stream failure; a dying process reports `worker_terminated`
    async fn stream_failure(&self, err: CodecError) -> BridgeError {
        match err {
            CodecError::Closed(reason) => {
                match tokio::time::timeout(EXIT_SETTLE, self.monitor.wait()).await {
                    Ok(state) => BridgeError::WorkerTerminated {
                        worker_id: self.id,
                        exit: state.to_string(),
                    },
                    Err(_) => BridgeError::StreamClosed {
                        worker_id: self.id,
                        reason,
                    },
                }
            }
            other => other.into(),
        }
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }

    fn record_success(&self) {
        *self
            .last_success
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(command: &str, args: &[&str]) -> Arc<WorkerSettings> {
        Arc::new(WorkerSettings {
            command: command.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            env: vec![],
            cwd: None,
            init_timeout: Duration::from_millis(500),
            terminate_grace: Duration::from_millis(200),
            health_check_timeout: Duration::from_millis(200),
            max_payload_bytes: codec::DEFAULT_MAX_PAYLOAD_BYTES,
        })
    }

    // ==================== WorkerId Tests ====================

    #[test]
    fn test_worker_id_display_and_serialize() {
        let id = WorkerId::from_raw(7);
        assert_eq!(id.to_string(), "worker-7");
        assert_eq!(serde_json::to_value(id).unwrap(), json!("worker-7"));
    }

    #[test]
    fn test_worker_ids_are_unique() {
        let a = WorkerId::next();
        let b = WorkerId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    // ==================== Health Tests ====================

    #[test]
    fn test_health_reusability() {
        assert!(WorkerHealth::Ready.is_reusable());
        assert!(!WorkerHealth::Unhealthy.is_reusable());
        assert!(!WorkerHealth::Terminated.is_reusable());
        assert_eq!(
            serde_json::to_value(WorkerHealth::Unhealthy).unwrap(),
            json!("unhealthy")
        );
    }

    #[test]
    fn test_launch_spec_appends_identity() {
        let settings = settings("python3", &["worker.py"]);
        let spec = settings.launch_spec(WorkerId::from_raw(4));
        assert_eq!(
            spec.args,
            vec!["worker.py", "--worker-id", "worker-4", "--mode", "pool-worker"]
        );
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = BridgeConfig::default();
        config.worker.command = "w".to_string();
        config.worker.env.insert("A".to_string(), "1".to_string());
        let settings = WorkerSettings::from_config(&config);
        assert_eq!(settings.env, vec![("A".to_string(), "1".to_string())]);
        assert_eq!(settings.init_timeout, config.worker.init_timeout);
    }

    // ==================== Handshake Tests ====================

    #[tokio::test]
    async fn test_handshake_fails_for_missing_executable() {
        let err = WorkerHandle::spawn(settings("/nonexistent/worker", &[]), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "worker_start_failed");
    }

    #[tokio::test]
    async fn test_handshake_fails_when_process_exits() {
        // `true` ignores its arguments and exits before answering
        let err = WorkerHandle::spawn(settings("true", &[]), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "worker_start_failed");
    }

    #[tokio::test]
    async fn test_handshake_fails_when_worker_is_silent() {
        let err = WorkerHandle::spawn(settings("sh", &["-c", "exec sleep 30"]), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no ping response"));
    }

    #[tokio::test]
    async fn test_handshake_rejects_echoed_request() {
        // A process that echoes frames back sends a request shape, not a response
        let err = WorkerHandle::spawn(settings("sh", &["-c", "exec cat"]), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "worker_start_failed");
    }

    #[tokio::test]
    async fn test_failed_handshake_notifies_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _ = WorkerHandle::spawn(settings("true", &[]), Some(tx)).await;
        let notified = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert!(notified.is_some());
    }
}
