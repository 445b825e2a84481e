// ABOUTME: Per-failure-class circuit breakers guarding pool access
//
// Each failure class (worker crashes, transport faults, operation timeouts)
// has its own Closed -> Open -> HalfOpen state machine. An open breaker fails
// requests fast with `circuit_open` until its cool-down elapses, then admits a
// single probe.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::error::BridgeError;

// === Failure Classes ===

/// Failure classes tracked by separate breakers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Worker process died mid-request
    WorkerTerminated,
    /// Framing, stream or spawn failures
    Transport,
    /// Worker did not answer in time
    OperationTimeout,
}

impl FailureClass {
    /// All classes, in reporting order
    pub const ALL: [Self; 3] = [Self::WorkerTerminated, Self::Transport, Self::OperationTimeout];

    /// Stable snake_case name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WorkerTerminated => "worker_terminated",
            Self::Transport => "transport",
            Self::OperationTimeout => "operation_timeout",
        }
    }

    /// Class an error counts against, if any
    ///
    /// Checkout exhaustion and worker-reported command errors are not
    /// failures of the pool's workers and never trip a breaker.
    #[must_use]
    pub const fn classify(err: &BridgeError) -> Option<Self> {
        match err {
            BridgeError::WorkerTerminated { .. } => Some(Self::WorkerTerminated),
            BridgeError::ProtocolError { .. }
            | BridgeError::StreamClosed { .. }
            | BridgeError::WorkerStartFailed { .. } => Some(Self::Transport),
            BridgeError::OperationTimeout { .. } => Some(Self::OperationTimeout),
            _ => None,
        }
    }
}

// === Circuit State ===

/// Circuit breaker state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests flow through
    Closed,

    /// Requests blocked until the deadline
    Open {
        /// When to transition to `HalfOpen`
        until: Instant,
    },

    /// One probe is in flight; others are rejected until it reports back
    HalfOpen {
        /// When an unreported probe is considered lost
        probe_expires: Instant,
    },
}

impl CircuitState {
    /// Stable snake_case name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open { .. } => "open",
            Self::HalfOpen { .. } => "half_open",
        }
    }
}

/// Serialisable view of one breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSummary {
    /// Failure class
    pub class: FailureClass,
    /// `closed`, `open` or `half_open`
    pub state: &'static str,
    /// Consecutive failures counted
    pub consecutive_failures: u32,
    /// Remaining cool-down when open
    pub retry_in_ms: Option<u64>,
}

// === Circuit Breaker ===

/// Circuit breaker for one failure class
#[derive(Debug)]
pub struct CircuitBreaker {
    class: FailureClass,

    /// Current state (protected by `RwLock` for concurrent access)
    state: RwLock<CircuitState>,

    /// Number of consecutive failures
    failure_count: AtomicU32,

    /// Failures required to open circuit
    failure_threshold: u32,

    /// Time spent open before probing
    cooldown: Duration,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub const fn new(class: FailureClass, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            class,
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            failure_threshold,
            cooldown,
        }
    }

    /// Failure class guarded by this breaker
    #[must_use]
    pub const fn class(&self) -> FailureClass {
        self.class
    }

    /// Check whether a request may proceed
    ///
    /// An expired `Open` becomes `HalfOpen` and this call is its trial. A
    /// trial that never reports back is replaced after one cool-down.
    pub fn can_execute(&self) -> Result<(), BridgeError> {
        let now = Instant::now();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if self.admit(&state, now)? {
            self.start_trial(&mut state, now);
        }
        Ok(())
    }

    /// Read-only admission check; `Ok(true)` means the call would be the half-open trial
    fn admit(&self, state: &CircuitState, now: Instant) -> Result<bool, BridgeError> {
        match state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open { until } if now < *until => Err(self.open_error(*until - now)),
            CircuitState::HalfOpen { probe_expires } if now < *probe_expires => {
                Err(self.open_error(*probe_expires - now))
            }
            CircuitState::Open { .. } | CircuitState::HalfOpen { .. } => Ok(true),
        }
    }

    fn start_trial(&self, state: &mut CircuitState, now: Instant) {
        *state = CircuitState::HalfOpen {
            probe_expires: now + self.cooldown,
        };
    }

    /// Record a successful request; closes the breaker
    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = CircuitState::Closed;
    }

    /// Record a failure of this class
    pub fn record_failure(&self) {
        let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        match &*state {
            CircuitState::Closed => {
                if failures >= self.failure_threshold {
                    tracing::warn!(
                        class = self.class.as_str(),
                        failures,
                        cooldown_ms = self.cooldown.as_millis(),
                        "Circuit breaker opened"
                    );
                    *state = CircuitState::Open {
                        until: Instant::now() + self.cooldown,
                    };
                }
            }
            CircuitState::HalfOpen { .. } => {
                // Probe failed, back to Open
                *state = CircuitState::Open {
                    until: Instant::now() + self.cooldown,
                };
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Current circuit state (for monitoring)
    pub fn state(&self) -> CircuitState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Force reset to Closed state
    pub fn reset(&self) {
        self.record_success();
    }

    /// Current consecutive failure count
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    /// Serialisable summary
    pub fn summary(&self) -> CircuitSummary {
        let state = self.state();
        let retry_in_ms = match &state {
            CircuitState::Open { until } => Some(
                u64::try_from(until.saturating_duration_since(Instant::now()).as_millis())
                    .unwrap_or(u64::MAX),
            ),
            _ => None,
        };
        CircuitSummary {
            class: self.class,
            state: state.as_str(),
            consecutive_failures: self.failure_count(),
            retry_in_ms,
        }
    }

    fn open_error(&self, retry_in: Duration) -> BridgeError {
        BridgeError::CircuitOpen {
            class: self.class.as_str().to_string(),
            retry_in,
        }
    }
}

// === Breaker Set ===

/// One breaker per failure class
#[derive(Debug)]
pub struct CircuitBreakers {
    breakers: [CircuitBreaker; 3],
}

impl CircuitBreakers {
    /// Create closed breakers for every class
    #[must_use]
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            breakers: FailureClass::ALL
                .map(|class| CircuitBreaker::new(class, failure_threshold, cooldown)),
        }
    }

    /// Breaker for a class
    #[must_use]
    pub fn get(&self, class: FailureClass) -> &CircuitBreaker {
        match class {
            FailureClass::WorkerTerminated => &self.breakers[0],
            FailureClass::Transport => &self.breakers[1],
            FailureClass::OperationTimeout => &self.breakers[2],
        }
    }

    /// Fail fast if any breaker refuses
    ///
    /// Half-open trials are only claimed once every breaker admits the call, so a
    /// refusal from one class never uses up another class's trial.
    pub fn can_execute(&self) -> Result<(), BridgeError> {
        let now = Instant::now();
        // Fixed lock order: the array order
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|b| b.state.write().unwrap_or_else(PoisonError::into_inner))
            .collect();

        let mut trials = [false; 3];
        for ((breaker, state), trial) in self.breakers.iter().zip(&states).zip(&mut trials) {
            *trial = breaker.admit(state, now)?;
        }
        for ((breaker, state), trial) in self.breakers.iter().zip(&mut states).zip(trials) {
            if trial {
                breaker.start_trial(state, now);
            }
        }
        Ok(())
    }

    /// Any success proves the pool serves requests again
    pub fn record_success(&self) {
        for breaker in &self.breakers {
            breaker.record_success();
        }
    }

    /// Count an error against its class; returns the class if it had one
    pub fn record_error(&self, err: &BridgeError) -> Option<FailureClass> {
        let class = FailureClass::classify(err)?;
        self.get(class).record_failure();
        Some(class)
    }

    /// Summaries of every breaker
    pub fn summaries(&self) -> Vec<CircuitSummary> {
        self.breakers.iter().map(CircuitBreaker::summary).collect()
    }
}
