// ABOUTME: Categorized error taxonomy returned to bridge callers
//
// Every error that reaches an end caller carries a category, a kind, a human
// message and structured context so calling code can make retry/fallback
// decisions without parsing strings.

use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use super::codec::CodecError;
use super::config::ConfigError;
use super::worker::WorkerId;

/// Coarse error category, stable across releases
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Checkout or operation deadline elapsed
    TimeoutError,
    /// Pool, worker or breaker refused the request
    ResourceError,
    /// Framing or transport failure on a worker stream
    CommunicationError,
    /// The worker answered with an error payload
    WorkerError,
    /// Unexpected internal fault or invalid configuration
    SystemError,
}

impl ErrorCategory {
    /// All categories, in reporting order
    pub const ALL: [Self; 5] = [
        Self::TimeoutError,
        Self::ResourceError,
        Self::CommunicationError,
        Self::WorkerError,
        Self::SystemError,
    ];

    /// Stable snake_case name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TimeoutError => "timeout_error",
            Self::ResourceError => "resource_error",
            Self::CommunicationError => "communication_error",
            Self::WorkerError => "worker_error",
            Self::SystemError => "system_error",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the bridge to its callers
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// No worker became available before the checkout deadline
    #[error("Checkout timed out after {waited:?} (limit {timeout:?})")]
    CheckoutTimeout {
        /// How long the caller actually waited
        waited: Duration,
        /// Configured checkout timeout
        timeout: Duration,
    },

    /// The worker did not answer before the operation deadline
    #[error("Operation '{command}' on {worker_id} timed out after {timeout:?}")]
    OperationTimeout {
        /// Worker that was serving the request
        worker_id: WorkerId,
        /// Command that timed out
        command: String,
        /// Configured operation timeout
        timeout: Duration,
    },

    /// The pool is draining or shut down
    #[error("Pool not available: {reason}")]
    PoolNotAvailable {
        /// Why the pool refused
        reason: String,
    },

    /// The worker process exited while it held the request
    #[error("Worker {worker_id} terminated ({exit})")]
    WorkerTerminated {
        /// Worker that died
        worker_id: WorkerId,
        /// Exit description (code or signal)
        exit: String,
    },

    /// A worker could not be spawned or failed its readiness handshake
    #[error("Worker failed to start: {reason}")]
    WorkerStartFailed {
        /// Spawn or handshake failure description
        reason: String,
    },

    /// The circuit breaker for a failure class is open
    #[error("Circuit open for {class}, retry in {retry_in:?}")]
    CircuitOpen {
        /// Failure class whose breaker is open
        class: String,
        /// Remaining cool-down
        retry_in: Duration,
    },

    /// A frame could not be decoded
    #[error("Protocol error: {reason}")]
    ProtocolError {
        /// Decoder diagnostic
        reason: String,
    },

    /// A payload exceeded the configured frame limit
    #[error("Payload too large: {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge {
        /// Encoded payload size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// The worker's stream closed or failed mid-exchange
    #[error("Stream closed on {worker_id}: {reason}")]
    StreamClosed {
        /// Worker whose stream failed
        worker_id: WorkerId,
        /// Underlying I/O failure
        reason: String,
    },

    /// The worker answered with an error payload
    #[error("Command '{command}' failed on {worker_id}: {message}")]
    CommandFailed {
        /// Worker that answered
        worker_id: WorkerId,
        /// Command that failed
        command: String,
        /// Error message reported by the worker
        message: String,
        /// Raw error payload from the worker
        details: Value,
    },

    /// Configuration rejected at startup
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unexpected internal fault
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    /// Category of this error
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::CheckoutTimeout { .. } | Self::OperationTimeout { .. } => {
                ErrorCategory::TimeoutError
            }
            Self::PoolNotAvailable { .. }
            | Self::WorkerTerminated { .. }
            | Self::WorkerStartFailed { .. }
            | Self::CircuitOpen { .. } => ErrorCategory::ResourceError,
            Self::ProtocolError { .. } | Self::PayloadTooLarge { .. } | Self::StreamClosed { .. } => {
                ErrorCategory::CommunicationError
            }
            Self::CommandFailed { .. } => ErrorCategory::WorkerError,
            Self::InvalidConfig(_) | Self::Internal(_) => ErrorCategory::SystemError,
        }
    }

    /// Fine-grained kind within the category
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CheckoutTimeout { .. } => "checkout_timeout",
            Self::OperationTimeout { .. } => "operation_timeout",
            Self::PoolNotAvailable { .. } => "pool_not_available",
            Self::WorkerTerminated { .. } => "worker_terminated",
            Self::WorkerStartFailed { .. } => "worker_start_failed",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::ProtocolError { .. } => "protocol_error",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::StreamClosed { .. } => "stream_closed",
            Self::CommandFailed { .. } => "command_failed",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Internal(_) => "internal",
        }
    }

    /// Structured context for programmatic handling
    #[must_use]
    pub fn context(&self) -> Value {
        match self {
            Self::CheckoutTimeout { waited, timeout } => json!({
                "waited_ms": millis(*waited),
                "timeout_ms": millis(*timeout),
            }),
            Self::OperationTimeout {
                worker_id,
                command,
                timeout,
            } => json!({
                "worker_id": worker_id.to_string(),
                "command": command,
                "timeout_ms": millis(*timeout),
            }),
            Self::PoolNotAvailable { reason } | Self::WorkerStartFailed { reason } => {
                json!({ "reason": reason })
            }
            Self::WorkerTerminated { worker_id, exit } => json!({
                "worker_id": worker_id.to_string(),
                "exit": exit,
            }),
            Self::CircuitOpen { class, retry_in } => json!({
                "class": class,
                "retry_in_ms": millis(*retry_in),
            }),
            Self::ProtocolError { reason } => json!({ "reason": reason }),
            Self::PayloadTooLarge { size, max } => json!({ "size": size, "max": max }),
            Self::StreamClosed { worker_id, reason } => json!({
                "worker_id": worker_id.to_string(),
                "reason": reason,
            }),
            Self::CommandFailed {
                worker_id,
                command,
                details,
                ..
            } => json!({
                "worker_id": worker_id.to_string(),
                "command": command,
                "details": details,
            }),
            Self::InvalidConfig(_) | Self::Internal(_) => json!({}),
        }
    }

    /// Whether the failure came from the transport or the worker process
    /// rather than the command itself
    #[must_use]
    pub const fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Self::ProtocolError { .. }
                | Self::StreamClosed { .. }
                | Self::WorkerStartFailed { .. }
        )
    }

    /// Convert into the serialisable report handed to end callers
    #[must_use]
    pub fn to_report(&self) -> ErrorReport {
        ErrorReport {
            category: self.category(),
            kind: self.kind(),
            message: self.to_string(),
            context: self.context(),
        }
    }
}

impl From<CodecError> for BridgeError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::PayloadTooLarge { size, max } => Self::PayloadTooLarge { size, max },
            other => Self::ProtocolError {
                reason: other.to_string(),
            },
        }
    }
}

impl From<ConfigError> for BridgeError {
    fn from(err: ConfigError) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

/// Categorized error tuple as seen by end callers
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    /// Coarse category
    pub category: ErrorCategory,
    /// Fine-grained kind
    pub kind: &'static str,
    /// Human-readable message
    pub message: String,
    /// Structured context
    pub context: Value,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_timeout_is_timeout_category() {
        let err = BridgeError::CheckoutTimeout {
            waited: Duration::from_millis(510),
            timeout: Duration::from_millis(500),
        };
        assert_eq!(err.category(), ErrorCategory::TimeoutError);
        assert_eq!(err.kind(), "checkout_timeout");
        assert_eq!(err.context()["timeout_ms"], 500);
        assert_eq!(err.context()["waited_ms"], 510);
    }

    #[test]
    fn test_resource_errors() {
        let terminated = BridgeError::WorkerTerminated {
            worker_id: WorkerId::from_raw(3),
            exit: "signal 9".to_string(),
        };
        assert_eq!(terminated.category(), ErrorCategory::ResourceError);
        assert_eq!(terminated.kind(), "worker_terminated");
        assert_eq!(terminated.context()["worker_id"], "worker-3");

        let draining = BridgeError::PoolNotAvailable {
            reason: "draining".to_string(),
        };
        assert_eq!(draining.category(), ErrorCategory::ResourceError);
        assert_eq!(draining.kind(), "pool_not_available");
    }

    #[test]
    fn test_codec_error_conversion() {
        let err: BridgeError = CodecError::PayloadTooLarge { size: 10, max: 5 }.into();
        assert!(matches!(err, BridgeError::PayloadTooLarge { size: 10, max: 5 }));
        assert_eq!(err.category(), ErrorCategory::CommunicationError);

        let err: BridgeError = CodecError::Truncated {
            expected: 8,
            actual: 3,
        }
        .into();
        assert_eq!(err.kind(), "protocol_error");
    }

    #[test]
    fn test_command_failed_is_worker_error() {
        let err = BridgeError::CommandFailed {
            worker_id: WorkerId::from_raw(1),
            command: "explode".to_string(),
            message: "Unknown command".to_string(),
            details: json!({"message": "Unknown command"}),
        };
        assert_eq!(err.category(), ErrorCategory::WorkerError);
        assert!(!err.is_transport_failure());
    }

    #[test]
    fn test_transport_failures() {
        assert!(BridgeError::ProtocolError {
            reason: "bad".to_string()
        }
        .is_transport_failure());
        assert!(BridgeError::StreamClosed {
            worker_id: WorkerId::from_raw(1),
            reason: "eof".to_string()
        }
        .is_transport_failure());
        assert!(!BridgeError::Internal("x".to_string()).is_transport_failure());
    }

    #[test]
    fn test_report_serialization() {
        let err = BridgeError::CircuitOpen {
            class: "worker_terminated".to_string(),
            retry_in: Duration::from_secs(3),
        };
        let report = serde_json::to_value(err.to_report()).unwrap();
        assert_eq!(report["category"], "resource_error");
        assert_eq!(report["kind"], "circuit_open");
        assert_eq!(report["context"]["retry_in_ms"], 3000);
        assert!(report["message"].as_str().unwrap().contains("worker_terminated"));
    }

    #[test]
    fn test_category_names() {
        let names: Vec<&str> = ErrorCategory::ALL.iter().map(|c| c.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "timeout_error",
                "resource_error",
                "communication_error",
                "worker_error",
                "system_error"
            ]
        );
    }
}
