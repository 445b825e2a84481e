// ABOUTME: CLI serve command dispatching newline-delimited JSON requests concurrently
//
// Each stdin line is `{command, args?, session_id?, idempotent?, end_session?, id?}`.
// Lines run concurrently against one bridge; every request produces exactly one
// stdout line `{ok:true,result}` or `{ok:false,error}`. EOF drains and shuts down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::ServeArgs;
use crate::bridge::{Bridge, BridgeConfig, BridgeError, BridgeRequest};

/// One request line
#[derive(Debug, Deserialize)]
struct ServeLine {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    idempotent: Option<bool>,
    #[serde(default)]
    end_session: bool,
}

pub async fn execute(args: ServeArgs, config: BridgeConfig) -> Result<()> {
    let bridge = Arc::new(Bridge::start(config).await.context("Failed to start bridge")?);
    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(write_lines(out_rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();
    let mut received = 0u64;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                received += 1;
                let bridge = Arc::clone(&bridge);
                let out_tx = out_tx.clone();
                in_flight.spawn(async move {
                    let response = handle_line(&bridge, &line).await;
                    let _ = out_tx.send(response.to_string());
                });
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
        }
    }

    info!(received, "stdin closed, draining");
    while in_flight.join_next().await.is_some() {}

    let report = bridge
        .shutdown(Duration::from_millis(args.shutdown_timeout_ms))
        .await;
    debug!(?report, "Serve shutdown complete");

    drop(out_tx);
    writer.await.context("Output writer failed")?
}

async fn write_lines(mut rx: mpsc::UnboundedReceiver<String>) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = rx.recv().await {
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn handle_line(bridge: &Bridge, line: &str) -> Value {
    let request: ServeLine = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Rejected malformed request line");
            let err = BridgeError::ProtocolError {
                reason: format!("invalid request line: {e}"),
            };
            return json!({"ok": false, "error": err.to_report()});
        }
    };

    let mut response = dispatch(bridge, &request).await;
    if let (Some(id), Some(object)) = (request.id, response.as_object_mut()) {
        object.insert("id".to_string(), id);
    }
    response
}

async fn dispatch(bridge: &Bridge, request: &ServeLine) -> Value {
    let result = match &request.command {
        Some(command) => {
            let mut call = BridgeRequest::new(command, request.args.clone());
            if let Some(session) = &request.session_id {
                call = call.with_session(session);
            }
            if let Some(idempotent) = request.idempotent {
                call = call.idempotent(idempotent);
            }
            Some(bridge.execute(call).await)
        }
        None => None,
    };

    let ended = match (&request.session_id, request.end_session) {
        (Some(session), true) => Some(bridge.end_session(session).await.is_some()),
        _ => None,
    };

    match (result, ended) {
        (Some(Ok(value)), _) => json!({"ok": true, "result": value}),
        (Some(Err(err)), _) => json!({"ok": false, "error": err.to_report()}),
        (None, Some(ended)) => json!({"ok": true, "result": {"session_ended": ended}}),
        (None, None) => {
            let err = BridgeError::ProtocolError {
                reason: "request needs a command or end_session with session_id".to_string(),
            };
            json!({"ok": false, "error": err.to_report()})
        }
    }
}
