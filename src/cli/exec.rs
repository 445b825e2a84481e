// ABOUTME: CLI exec command running a single request through a fresh bridge
//
// Starts the pool, executes one command (optionally under a session), ends the
// session so the worker drops its state, then shuts the pool down.

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Map, Value};

use super::{ExecArgs, OutputFormat, SHUTDOWN_TIMEOUT};
use crate::bridge::{Bridge, BridgeConfig, BridgeRequest};

/// Parse `--args`, defaulting to an empty object
fn parse_args(raw: Option<&str>) -> Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).context("--args is not valid JSON"),
        None => Ok(Value::Object(Map::new())),
    }
}

pub async fn execute(args: ExecArgs, config: BridgeConfig, format: OutputFormat) -> Result<()> {
    let payload = parse_args(args.args.as_deref())?;
    let bridge = Bridge::start(config).await.context("Failed to start bridge")?;

    let mut request = BridgeRequest::new(&args.command, payload);
    if let Some(session) = &args.session {
        request = request.with_session(session);
    }
    if args.idempotent {
        request = request.idempotent(true);
    }

    let result = bridge.execute(request).await;
    if let Some(session) = &args.session {
        bridge.end_session(session).await;
    }
    bridge.shutdown(SHUTDOWN_TIMEOUT).await;

    match result {
        Ok(value) => {
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&json!({"ok": true, "result": value}))?);
                }
                OutputFormat::Text => println!("{}", serde_json::to_string_pretty(&value)?),
            }
            Ok(())
        }
        Err(err) => {
            if matches!(format, OutputFormat::Json) {
                let output = json!({"ok": false, "error": err.to_report()});
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            Err(anyhow!("{} failed [{}]: {err}", args.command, err.kind()))
        }
    }
}
