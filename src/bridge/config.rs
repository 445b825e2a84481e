// ABOUTME: Configuration surface for the process-pool bridge
//
// Defines BridgeConfig with every tunable parameter:
// - Worker launch (command, args, env, init/terminate timeouts)
// - Pool sizing and timeouts
// - Session idle reaping
// - Retry and circuit breaker policy
//
// Loaded from TOML with POOLBRIDGE_* environment overrides, validated once,
// then frozen for the lifetime of the pool.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use super::codec::DEFAULT_MAX_PAYLOAD_BYTES;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "POOLBRIDGE_";

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config from {path}: {source}")]
    Read {
        /// File that failed
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("Failed to parse config from {path}: {message}")]
    Parse {
        /// File that failed
        path: PathBuf,
        /// Parser diagnostic
        message: String,
    },

    /// An environment override has an unparseable value
    #[error("Invalid value for {key}: '{value}'")]
    InvalidEnv {
        /// Variable name
        key: String,
        /// Offending value
        value: String,
    },

    /// A field holds a value the bridge cannot run with
    #[error("Invalid setting '{field}': {reason}")]
    Invalid {
        /// Dotted field path
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// Top-level bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// How to launch worker subprocesses
    pub worker: WorkerConfig,
    /// Pool sizing and timeouts
    pub pool: PoolConfig,
    /// Session bookkeeping
    pub session: SessionConfig,
    /// Retry and circuit breaker policy
    pub recovery: RecoveryConfig,
}

/// Worker subprocess launch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Executable to spawn
    pub command: String,

    /// Arguments passed before the pool's own `--worker-id` / `--mode`
    pub args: Vec<String>,

    /// Extra environment variables
    pub env: BTreeMap<String, String>,

    /// Working directory (inherits the bridge's when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Deadline for the readiness handshake
    #[serde(with = "duration_ms")]
    pub init_timeout: Duration,

    /// Wait between SIGTERM and SIGKILL
    #[serde(with = "duration_ms")]
    pub terminate_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: vec![],
            env: BTreeMap::new(),
            cwd: None,
            init_timeout: Duration::from_secs(10),
            terminate_grace: Duration::from_secs(2),
        }
    }
}

/// Pool sizing and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Target number of long-lived workers
    pub size: usize,

    /// Extra workers created on demand beyond `size`
    pub max_overflow: usize,

    // === Timeouts ===
    /// Maximum wait for a free worker
    #[serde(with = "duration_ms")]
    pub checkout_timeout: Duration,

    /// Maximum wait for a worker's response
    #[serde(with = "duration_ms")]
    pub operation_timeout: Duration,

    // === Health ===
    /// Interval between health sweeps
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,

    /// Ping deadline used by health checks
    #[serde(with = "duration_ms")]
    pub health_check_timeout: Duration,

    /// Largest accepted frame payload
    pub max_payload_bytes: usize,

    /// Create workers on first demand instead of at startup
    pub lazy: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            max_overflow: 2,
            checkout_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(2),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            lazy: false,
        }
    }
}

impl PoolConfig {
    /// Pool-wide concurrency ceiling
    pub const fn capacity(&self) -> usize {
        self.size + self.max_overflow
    }
}

/// Session bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions idle longer than this are reaped
    #[serde(with = "duration_ms")]
    pub session_idle_timeout: Duration,

    /// How often the reaper runs
    #[serde(with = "duration_ms")]
    pub reap_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_idle_timeout: Duration::from_secs(3600),
            reap_interval: Duration::from_secs(60),
        }
    }
}

/// Retry and circuit breaker policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Total attempts for retryable requests (1 = no retry)
    pub retry_max_attempts: u32,

    /// First backoff delay
    #[serde(with = "duration_ms")]
    pub retry_backoff_base: Duration,

    /// Backoff cap
    #[serde(with = "duration_ms")]
    pub retry_backoff_max: Duration,

    /// Consecutive failures of one class before its breaker opens
    pub circuit_breaker_threshold: u32,

    /// How long an open breaker rejects before half-opening
    #[serde(with = "duration_ms")]
    pub circuit_breaker_cooldown: Duration,

    /// Commands that are safe to retry by default
    pub idempotent_commands: Vec<String>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            retry_max_attempts: 3,
            retry_backoff_base: Duration::from_millis(100),
            retry_backoff_max: Duration::from_secs(5),
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(30),
            idempotent_commands: vec![
                "ping".to_string(),
                "get_stats".to_string(),
                "cleanup_session".to_string(),
            ],
        }
    }
}

impl RecoveryConfig {
    /// Whether a command is idempotent by configuration
    pub fn is_idempotent(&self, command: &str) -> bool {
        self.idempotent_commands.iter().any(|c| c == command)
    }
}

impl BridgeConfig {
    /// Load configuration from an explicit path or the default locations,
    /// then apply `POOLBRIDGE_*` environment overrides
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::get_config_paths().into_iter().find(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };

        config.apply_env(load_from_env())?;
        Ok(config)
    }

    /// Parse a single TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Serialize to pretty TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<memory>"),
            message: e.to_string(),
        })
    }

    /// Configuration file paths in order of precedence
    fn get_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![];

        // 1. Local project config
        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd.join(".poolbridge").join("config.toml"));
        }

        // 2. User config (~/.poolbridge/config.toml)
        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".poolbridge").join("config.toml"));
        }

        paths
    }

    /// Apply `POOLBRIDGE_*` overrides; unknown keys are ignored
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "SIZE" => self.pool.size = parse_env(&key, &value)?,
                "MAX_OVERFLOW" => self.pool.max_overflow = parse_env(&key, &value)?,
                "CHECKOUT_TIMEOUT_MS" => self.pool.checkout_timeout = parse_ms(&key, &value)?,
                "OPERATION_TIMEOUT_MS" => self.pool.operation_timeout = parse_ms(&key, &value)?,
                "HEALTH_CHECK_INTERVAL_MS" => {
                    self.pool.health_check_interval = parse_ms(&key, &value)?;
                }
                "SESSION_IDLE_TIMEOUT_MS" => {
                    self.session.session_idle_timeout = parse_ms(&key, &value)?;
                }
                "RETRY_MAX_ATTEMPTS" => {
                    self.recovery.retry_max_attempts = parse_env(&key, &value)?;
                }
                "CIRCUIT_BREAKER_THRESHOLD" => {
                    self.recovery.circuit_breaker_threshold = parse_env(&key, &value)?;
                }
                "CIRCUIT_BREAKER_COOLDOWN_MS" => {
                    self.recovery.circuit_breaker_cooldown = parse_ms(&key, &value)?;
                }
                "WORKER_COMMAND" => self.worker.command = value,
                _ => {}
            }
        }
        Ok(())
    }

    /// Reject settings the bridge cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.command.trim().is_empty() {
            return Err(invalid("worker.command", "must not be empty"));
        }
        if self.pool.size == 0 {
            return Err(invalid("pool.size", "must be at least 1"));
        }
        if self.pool.max_payload_bytes == 0 {
            return Err(invalid("pool.max_payload_bytes", "must be at least 1"));
        }
        if self.recovery.retry_max_attempts == 0 {
            return Err(invalid("recovery.retry_max_attempts", "must be at least 1"));
        }
        if self.recovery.circuit_breaker_threshold == 0 {
            return Err(invalid("recovery.circuit_breaker_threshold", "must be at least 1"));
        }

        let timeouts = [
            ("worker.init_timeout", self.worker.init_timeout),
            ("pool.checkout_timeout", self.pool.checkout_timeout),
            ("pool.operation_timeout", self.pool.operation_timeout),
            ("pool.health_check_interval", self.pool.health_check_interval),
            ("pool.health_check_timeout", self.pool.health_check_timeout),
            ("session.session_idle_timeout", self.session.session_idle_timeout),
            ("session.reap_interval", self.session.reap_interval),
        ];
        if let Some((field, _)) = timeouts.iter().find(|(_, d)| d.is_zero()) {
            return Err(invalid(*field, "must be greater than zero"));
        }

        if self.recovery.retry_backoff_base > self.recovery.retry_backoff_max {
            return Err(invalid(
                "recovery.retry_backoff_base",
                "must not exceed retry_backoff_max",
            ));
        }
        Ok(())
    }
}

/// Collect `POOLBRIDGE_*` variables from the process environment
pub fn load_from_env() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with(ENV_PREFIX))
        .collect()
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_ms(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_env::<u64>(key, value).map(Duration::from_millis)
}

/// Serde helper for Duration as milliseconds (u64)
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    /// Serialize as whole milliseconds
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    /// Deserialize from whole milliseconds
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn runnable() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.worker.command = "pool_worker".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.pool.size, 4);
        assert_eq!(config.pool.max_overflow, 2);
        assert_eq!(config.pool.capacity(), 6);
        assert!(!config.pool.lazy);
        assert_eq!(config.recovery.retry_max_attempts, 3);
        assert_eq!(config.session.session_idle_timeout, Duration::from_secs(3600));
        assert!(config.recovery.is_idempotent("ping"));
        assert!(!config.recovery.is_idempotent("put_resource"));
    }

    #[test]
    fn test_default_requires_worker_command() {
        let err = BridgeConfig::default().validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "worker.command",
                ..
            }
        ));
        assert!(runnable().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_size_and_timeouts() {
        let mut config = runnable();
        config.pool.size = 0;
        assert!(config.validate().is_err());

        let mut config = runnable();
        config.pool.checkout_timeout = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pool.checkout_timeout"));
    }

    #[test]
    fn test_parse_partial_toml_with_millis() {
        let toml_str = r#"
            [worker]
            command = "python3"
            args = ["worker.py"]

            [pool]
            size = 2
            checkout_timeout = 250

            [recovery]
            circuit_breaker_cooldown = 1500
        "#;
        let config: BridgeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.worker.command, "python3");
        assert_eq!(config.pool.size, 2);
        assert_eq!(config.pool.max_overflow, 2);
        assert_eq!(config.pool.checkout_timeout, Duration::from_millis(250));
        assert_eq!(
            config.recovery.circuit_breaker_cooldown,
            Duration::from_millis(1500)
        );
        assert_eq!(config.worker.init_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = runnable();
        let text = config.to_toml().unwrap();
        let parsed: BridgeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.pool.operation_timeout, config.pool.operation_timeout);
        assert_eq!(parsed.worker.command, "pool_worker");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = runnable();
        config
            .apply_env(vec![
                ("POOLBRIDGE_SIZE".to_string(), "8".to_string()),
                ("POOLBRIDGE_CHECKOUT_TIMEOUT_MS".to_string(), "750".to_string()),
                ("POOLBRIDGE_WORKER_COMMAND".to_string(), "/bin/w".to_string()),
                ("POOLBRIDGE_UNKNOWN".to_string(), "x".to_string()),
                ("HOME".to_string(), "/root".to_string()),
            ])
            .unwrap();
        assert_eq!(config.pool.size, 8);
        assert_eq!(config.pool.checkout_timeout, Duration::from_millis(750));
        assert_eq!(config.worker.command, "/bin/w");
    }

    #[test]
    fn test_env_override_invalid_value() {
        let mut config = runnable();
        let err = config
            .apply_env(vec![("POOLBRIDGE_SIZE".to_string(), "lots".to_string())])
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pool]\nsize = 3\nlazy = true").unwrap();

        let config = BridgeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.pool.size, 3);
        assert!(config.pool.lazy);
    }

    #[test]
    fn test_from_file_errors() {
        let missing = BridgeConfig::from_file(Path::new("/nonexistent/poolbridge.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pool]\nsize = \"many\"").unwrap();
        let bad = BridgeConfig::from_file(file.path());
        assert!(matches!(bad, Err(ConfigError::Parse { .. })));
    }
}
