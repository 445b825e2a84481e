// ABOUTME: Retry policy, exponential backoff and recovery strategies around pool calls
//
// Idempotent requests are retried on checkout timeouts, worker crashes and
// transport faults with exponential backoff. Non-idempotent requests fail fast
// unless the caller supplies a custom recovery function. Every attempt first
// consults the per-class circuit breakers.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::circuit_breaker::{CircuitBreakers, CircuitSummary};
use super::config::RecoveryConfig;
use super::error::{BridgeError, BridgeResult};

// === Exponential Backoff ===

/// Exponential backoff calculator for retry and respawn delays
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Base delay duration
    base: Duration,

    /// Maximum delay cap
    max: Duration,

    /// Current attempt number (0-indexed)
    current_attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff calculator
    #[must_use]
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current_attempt: 0,
        }
    }

    /// Calculate the next delay and increment the attempt counter
    ///
    /// Returns `min(base * 2^attempt, max)`
    pub fn next_delay(&mut self) -> Duration {
        let multiplier = 2u64.saturating_pow(self.current_attempt);
        let base_millis = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(base_millis.saturating_mul(multiplier));

        self.current_attempt = self.current_attempt.saturating_add(1);

        std::cmp::min(delay, self.max)
    }

    /// Reset the attempt counter to 0
    pub const fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Get the current attempt number
    #[must_use]
    pub const fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}

// === Strategies ===

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Try again after the given delay
    Retry {
        /// Delay before the next attempt
        after: Duration,
    },
    /// Surface the error to the caller
    GiveUp,
}

/// Caller-supplied recovery function: `(error, attempt) -> decision`
pub type RecoveryFn = Arc<dyn Fn(&BridgeError, u32) -> RecoveryDecision + Send + Sync>;

/// How a request recovers from failures
#[derive(Clone, Default)]
pub enum RecoveryStrategy {
    /// Retry retryable failures with exponential backoff
    Retry,
    /// Surface the first failure
    #[default]
    FailFast,
    /// Let the caller decide after each failure
    CustomFunction(RecoveryFn),
}

impl std::fmt::Debug for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry => f.write_str("Retry"),
            Self::FailFast => f.write_str("FailFast"),
            Self::CustomFunction(_) => f.write_str("CustomFunction(..)"),
        }
    }
}

impl RecoveryStrategy {
    /// Default strategy for a request: idempotent retries, others fail fast
    #[must_use]
    pub const fn for_idempotency(idempotent: bool) -> Self {
        if idempotent {
            Self::Retry
        } else {
            Self::FailFast
        }
    }

    /// Wrap a closure as a custom strategy
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&BridgeError, u32) -> RecoveryDecision + Send + Sync + 'static,
    {
        Self::CustomFunction(Arc::new(f))
    }
}

/// Whether the built-in `Retry` strategy retries this error
#[must_use]
pub const fn is_retryable(err: &BridgeError) -> bool {
    matches!(
        err,
        BridgeError::CheckoutTimeout { .. }
            | BridgeError::WorkerTerminated { .. }
            | BridgeError::WorkerStartFailed { .. }
            | BridgeError::ProtocolError { .. }
            | BridgeError::StreamClosed { .. }
    )
}

/// Errors no strategy may retry: the pool is refusing on purpose
const fn is_terminal(err: &BridgeError) -> bool {
    matches!(
        err,
        BridgeError::PoolNotAvailable { .. }
            | BridgeError::CircuitOpen { .. }
            | BridgeError::InvalidConfig(_)
    )
}

// === Recovery Layer ===

/// Retry limits shared by all strategies
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// First backoff delay
    pub backoff_base: Duration,
    /// Backoff cap
    pub backoff_max: Duration,
}

impl RetryPolicy {
    /// Policy from configuration
    #[must_use]
    pub const fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts,
            backoff_base: config.retry_backoff_base,
            backoff_max: config.retry_backoff_max,
        }
    }
}

/// Wraps pool calls with retry, backoff and circuit breaking
#[derive(Debug)]
pub struct RecoveryLayer {
    policy: RetryPolicy,
    breakers: CircuitBreakers,
    retries: AtomicU64,
    rejected: AtomicU64,
}

impl RecoveryLayer {
    /// Create a layer from configuration
    #[must_use]
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            policy: RetryPolicy::from_config(config),
            breakers: CircuitBreakers::new(
                config.circuit_breaker_threshold,
                config.circuit_breaker_cooldown,
            ),
            retries: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Run `op` under `strategy`
    ///
    /// `op` receives the zero-based attempt number. An open breaker fails the
    /// call immediately without sleeping. The number of attempts never exceeds
    /// the policy's `max_attempts`, whatever a custom function decides.
    pub async fn run<T, F, Fut>(
        &self,
        command: &str,
        strategy: &RecoveryStrategy,
        mut op: F,
    ) -> BridgeResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = BridgeResult<T>>,
    {
        let mut backoff = ExponentialBackoff::new(self.policy.backoff_base, self.policy.backoff_max);
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            if let Err(err) = self.breakers.can_execute() {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(command = %command, error = %err, "Rejected by circuit breaker");
                return Err(err);
            }

            let err = match op(attempt).await {
                Ok(value) => {
                    self.breakers.record_success();
                    return Ok(value);
                }
                Err(err) => err,
            };

            if matches!(err, BridgeError::CommandFailed { .. }) {
                // The worker answered; the pool itself is fine
                self.breakers.record_success();
            } else {
                self.breakers.record_error(&err);
            }

            let exhausted = attempt + 1 >= max_attempts;
            let decision = if exhausted || is_terminal(&err) {
                RecoveryDecision::GiveUp
            } else {
                match strategy {
                    RecoveryStrategy::FailFast => RecoveryDecision::GiveUp,
                    RecoveryStrategy::Retry if is_retryable(&err) => RecoveryDecision::Retry {
                        after: backoff.next_delay(),
                    },
                    RecoveryStrategy::Retry => RecoveryDecision::GiveUp,
                    RecoveryStrategy::CustomFunction(decide) => decide(&err, attempt),
                }
            };

            match decision {
                RecoveryDecision::GiveUp => {
                    if attempt > 0 {
                        warn!(command = %command, attempts = attempt + 1, error = %err, "Giving up after retries");
                    }
                    return Err(err);
                }
                RecoveryDecision::Retry { after } => {
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        command = %command,
                        attempt = attempt + 1,
                        delay_ms = after.as_millis(),
                        kind = err.kind(),
                        "Retrying request"
                    );
                    tokio::time::sleep(after).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Breakers, for inspection
    #[must_use]
    pub const fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    /// Breaker summaries for the status surface
    #[must_use]
    pub fn circuit_summaries(&self) -> Vec<CircuitSummary> {
        self.breakers.summaries()
    }

    /// Retries performed so far
    #[must_use]
    pub fn retries_total(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Requests rejected by an open breaker
    #[must_use]
    pub fn rejected_total(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::worker::WorkerId;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    fn config(max_attempts: u32, threshold: u32) -> RecoveryConfig {
        RecoveryConfig {
            retry_max_attempts: max_attempts,
            retry_backoff_base: Duration::from_millis(1),
            retry_backoff_max: Duration::from_millis(5),
            circuit_breaker_threshold: threshold,
            circuit_breaker_cooldown: Duration::from_secs(30),
            ..RecoveryConfig::default()
        }
    }

    fn terminated() -> BridgeError {
        BridgeError::WorkerTerminated {
            worker_id: WorkerId::from_raw(1),
            exit: "signal 9".to_string(),
        }
    }

    // ==================== Backoff Tests ====================

    #[test]
    fn test_exponential_backoff() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(800));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.current_attempt(), 5);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_saturates() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_secs(60));
        }
    }

    // ==================== Strategy Tests ====================

    #[test]
    fn test_default_strategy_by_idempotency() {
        assert!(matches!(
            RecoveryStrategy::for_idempotency(true),
            RecoveryStrategy::Retry
        ));
        assert!(matches!(
            RecoveryStrategy::for_idempotency(false),
            RecoveryStrategy::FailFast
        ));
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(is_retryable(&terminated()));
        assert!(is_retryable(&BridgeError::CheckoutTimeout {
            waited: Duration::ZERO,
            timeout: Duration::ZERO
        }));
        assert!(!is_retryable(&BridgeError::OperationTimeout {
            worker_id: WorkerId::from_raw(1),
            command: "sleep".to_string(),
            timeout: Duration::ZERO,
        }));
        assert!(!is_retryable(&BridgeError::PoolNotAvailable {
            reason: "draining".to_string()
        }));
    }

    // ==================== Recovery Layer Tests ====================

    #[tokio::test]
    async fn test_retry_until_success() {
        let layer = RecoveryLayer::new(&config(3, 10));
        let calls = AtomicU32::new(0);

        let result = layer
            .run("ping", &RecoveryStrategy::Retry, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(terminated())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(layer.retries_total(), 2);
    }

    #[tokio::test]
    async fn test_retry_respects_max_attempts() {
        let layer = RecoveryLayer::new(&config(2, 10));
        let calls = AtomicU32::new(0);

        let result: BridgeResult<()> = layer
            .run("ping", &RecoveryStrategy::Retry, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(terminated()) }
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), "worker_terminated");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fail_fast_does_not_retry() {
        let layer = RecoveryLayer::new(&config(5, 10));
        let calls = AtomicU32::new(0);

        let result: BridgeResult<()> = layer
            .run("put_resource", &RecoveryStrategy::FailFast, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(terminated()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_command_failed_is_never_retried() {
        let layer = RecoveryLayer::new(&config(5, 1));
        let calls = AtomicU32::new(0);

        let result: BridgeResult<()> = layer
            .run("nope", &RecoveryStrategy::Retry, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(BridgeError::CommandFailed {
                        worker_id: WorkerId::from_raw(1),
                        command: "nope".to_string(),
                        message: "Unknown command".to_string(),
                        details: serde_json::Value::Null,
                    })
                }
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), "command_failed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Threshold is 1, but command errors do not trip breakers
        assert!(layer.breakers().can_execute().is_ok());
    }

    #[tokio::test]
    async fn test_custom_function_controls_retries() {
        let layer = RecoveryLayer::new(&config(4, 10));
        let calls = AtomicU32::new(0);
        let strategy = RecoveryStrategy::custom(|err, attempt| {
            if err.kind() == "worker_terminated" && attempt < 1 {
                RecoveryDecision::Retry {
                    after: Duration::from_millis(1),
                }
            } else {
                RecoveryDecision::GiveUp
            }
        });

        let result: BridgeResult<()> = layer
            .run("put_resource", &strategy, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(terminated()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_custom_function_capped_by_max_attempts() {
        let layer = RecoveryLayer::new(&config(3, 10));
        let calls = AtomicU32::new(0);
        let strategy = RecoveryStrategy::custom(|_, _| RecoveryDecision::Retry {
            after: Duration::ZERO,
        });

        let _: BridgeResult<()> = layer
            .run("x", &strategy, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(terminated()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast_without_delay() {
        let layer = RecoveryLayer::new(&RecoveryConfig {
            retry_backoff_base: Duration::from_secs(5),
            retry_backoff_max: Duration::from_secs(5),
            ..config(1, 2)
        });

        for _ in 0..2 {
            let _: BridgeResult<()> = layer
                .run("ping", &RecoveryStrategy::Retry, |_| async { Err(terminated()) })
                .await;
        }

        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result: BridgeResult<()> = layer
            .run("ping", &RecoveryStrategy::Retry, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), "circuit_open");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(layer.rejected_total(), 1);
    }

    #[tokio::test]
    async fn test_pool_not_available_is_terminal() {
        let layer = RecoveryLayer::new(&config(5, 10));
        let calls = AtomicU32::new(0);
        let strategy = RecoveryStrategy::custom(|_, _| RecoveryDecision::Retry {
            after: Duration::ZERO,
        });

        let _: BridgeResult<()> = layer
            .run("ping", &strategy, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(BridgeError::PoolNotAvailable {
                        reason: "draining".to_string(),
                    })
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
