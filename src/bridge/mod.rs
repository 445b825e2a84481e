// ABOUTME: Process-pool bridge keeping long-lived worker subprocesses warm
//
// Callers submit commands; the bridge checks out a warm worker, exchanges one
// length-prefixed frame pair with it and checks it back in.
//
// Key components:
// - codec: 4-byte big-endian length prefix + JSON request/response frames
// - process: subprocess spawn, exit watcher, SIGTERM/SIGKILL termination
// - worker: one subprocess with handshake, health state and send_and_await
// - pool: checkout/checkin leases, overflow, session affinity, replacement
// - session: logical client contexts and cleanup hints
// - circuit_breaker / recovery: per-class breakers, retry and backoff
// - health: periodic sweep and stale-session reap
// - supervisor: the `Bridge` tying it all together

/// Per-failure-class circuit breakers
pub mod circuit_breaker;
/// Length-prefixed JSON frame codec
pub mod codec;
/// Configuration loading and validation
pub mod config;
/// Error taxonomy surfaced to callers
pub mod error;
/// Health sweep and session reap loop
pub mod health;
/// Cumulative counters for the status surface
pub mod metrics;
/// Worker pool with checkout/checkin leases
pub mod pool;
/// Worker subprocess spawn, exit watch and termination
pub mod process;
/// Retry policy, backoff and recovery strategies
pub mod recovery;
/// Session registry
pub mod session;
/// The `Bridge` supervisor
pub mod supervisor;
/// Handle for one worker subprocess
pub mod worker;

// Re-exports for convenient access
pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult, ErrorCategory, ErrorReport};
pub use health::HealthStatus;
pub use pool::{CleanupOutcome, PoolStatus, ShutdownReport, WorkerLease, WorkerPool};
pub use recovery::{RecoveryDecision, RecoveryStrategy};
pub use session::SessionRegistry;
pub use supervisor::{Bridge, BridgeRequest, BridgeStatus};
pub use worker::{WorkerHandle, WorkerHealth, WorkerId};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_structure() {
        let config = BridgeConfig::default();
        assert_eq!(config.pool.size, 4);
        assert_eq!(config.pool.max_overflow, 2);
    }
}
