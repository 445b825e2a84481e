// ABOUTME: Shared fixtures for integration tests driving the real pool_worker binary

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use poolbridge::bridge::config::BridgeConfig;
use poolbridge::bridge::metrics::BridgeMetrics;
use poolbridge::bridge::worker::WorkerSettings;
use poolbridge::bridge::WorkerPool;

/// Path of the reference worker built alongside the tests
pub fn worker_binary() -> &'static str {
    env!("CARGO_BIN_EXE_pool_worker")
}

/// Config pointing at the reference worker with test-friendly timings
pub fn test_config(size: usize, max_overflow: usize) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.worker.command = worker_binary().to_string();
    config.worker.init_timeout = Duration::from_secs(5);
    config.worker.terminate_grace = Duration::from_millis(500);
    config.pool.size = size;
    config.pool.max_overflow = max_overflow;
    config.pool.checkout_timeout = Duration::from_secs(2);
    config.pool.operation_timeout = Duration::from_secs(5);
    config.pool.health_check_interval = Duration::from_millis(200);
    config.pool.health_check_timeout = Duration::from_secs(1);
    config.recovery.retry_backoff_base = Duration::from_millis(10);
    config.recovery.retry_backoff_max = Duration::from_millis(100);
    config
}

/// Worker settings for driving a `WorkerHandle` directly
pub fn worker_settings() -> Arc<WorkerSettings> {
    Arc::new(WorkerSettings::from_config(&test_config(1, 0)))
}

/// Start a bare pool without the health loop
pub async fn start_pool(config: &BridgeConfig) -> (WorkerPool, Arc<BridgeMetrics>) {
    let metrics = Arc::new(BridgeMetrics::new());
    let pool = WorkerPool::start(config, Arc::clone(&metrics))
        .await
        .expect("pool should start");
    (pool, metrics)
}

/// Poll `check` every 20ms until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
