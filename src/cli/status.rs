// ABOUTME: CLI status command printing the bridge status surface
//
// Starts the pool, captures one status snapshot and prints it as a table or
// pretty JSON before shutting down.

use anyhow::{Context, Result};

use super::{OutputFormat, SHUTDOWN_TIMEOUT};
use crate::bridge::{Bridge, BridgeConfig, BridgeStatus};

pub async fn execute(config: BridgeConfig, format: OutputFormat) -> Result<()> {
    let bridge = Bridge::start(config).await.context("Failed to start bridge")?;
    let status = bridge.status().await;
    bridge.shutdown(SHUTDOWN_TIMEOUT).await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Text => print!("{}", render_text(&status)),
    }
    Ok(())
}

fn render_text(status: &BridgeStatus) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Pool: {} live / {} target (+{} overflow allowed, {} in use)\n",
        status.live_workers, status.pool_size, status.max_overflow, status.overflow_in_use
    ));
    out.push_str(&format!(
        "Health: {}   Free: {}   Busy: {}   Sessions: {}\n",
        status.health.as_str(),
        status.free_workers,
        status.busy_workers,
        status.active_sessions
    ));

    if !status.workers.is_empty() {
        out.push_str(&format!(
            "\n{:<12} {:<8} {:<11} {:<9} {:<7} {}\n",
            "WORKER", "PID", "HEALTH", "SERVED", "ERRORS", "SESSION"
        ));
        for worker in &status.workers {
            out.push_str(&format!(
                "{:<12} {:<8} {:<11} {:<9} {:<7} {}\n",
                worker.worker_id.to_string(),
                worker.pid,
                worker.health.as_str(),
                worker.requests_served,
                worker.errors,
                worker.bound_session.as_deref().unwrap_or("-")
            ));
        }
    }

    out.push('\n');
    for circuit in &status.circuit {
        out.push_str(&format!(
            "Circuit {:<18} {:<10} failures {}\n",
            circuit.class.as_str(),
            circuit.state,
            circuit.consecutive_failures
        ));
    }
    out.push_str(&format!(
        "Requests: {} total, {} ok, {} errors\n",
        status.total_requests, status.total_successes, status.error_counts.total
    ));
    out
}
