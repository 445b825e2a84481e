// ABOUTME: Reference pool worker speaking the length-prefixed JSON frame protocol
//
// Binary: pool_worker
// Reads request frames from stdin, writes response frames to stdout, logs to
// stderr. Handles one request at a time. Besides `ping`, `cleanup_session` and
// `shutdown` it keeps a resource table and a key/value store, both namespaced
// by session, whole-worker `cleanup`/`reset_state`, plus a handful of
// fault-injection commands used by the integration tests.

#![allow(missing_docs)]

use std::collections::{BTreeSet, HashMap};
use std::io::{self, BufReader, BufWriter, Write};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use poolbridge::bridge::codec::{
    encode_frame, encode_response, parse_request, read_frame_blocking, write_frame_blocking,
    Request, Response, DEFAULT_MAX_PAYLOAD_BYTES,
};

/// Namespace for requests that carry no `session_id`
const ANONYMOUS_SESSION: &str = "anonymous";

#[derive(Parser)]
#[command(name = "pool_worker", about = "Reference worker for poolbridge", args_override_self = true)]
struct Args {
    /// Identity assigned by the pool
    #[arg(long, default_value = "standalone")]
    worker_id: String,

    /// Run mode
    #[arg(long, value_enum, default_value = "pool-worker")]
    mode: Mode,

    /// Simulated slow start before answering anything
    #[arg(long, default_value_t = 0)]
    startup_delay_ms: u64,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Standalone,
    PoolWorker,
}

impl Mode {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Standalone => "standalone",
            Self::PoolWorker => "pool-worker",
        }
    }
}

/// What the main loop does after a command
enum Action {
    Reply(Result<Value, String>),
    /// Answer, flush, then exit 0
    ReplyAndExit(Value),
    /// Exit without answering
    Exit(i32),
    /// Write these frames verbatim
    Frames(Vec<Vec<u8>>),
}

struct WorkerState {
    worker_id: String,
    mode: Mode,
    started: Instant,
    commands_handled: u64,
    errors: u64,
    cleanups: u64,
    resources: HashMap<(String, String), Value>,
    session_data: HashMap<String, Map<String, Value>>,
}

impl WorkerState {
    fn new(args: &Args) -> Self {
        Self {
            worker_id: args.worker_id.clone(),
            mode: args.mode,
            started: Instant::now(),
            commands_handled: 0,
            errors: 0,
            cleanups: 0,
            resources: HashMap::new(),
            session_data: HashMap::new(),
        }
    }

    fn handle(&mut self, request: &Request) -> Action {
        self.commands_handled += 1;
        let args = &request.args;

        match request.command.as_str() {
            "ping" => Action::Reply(Ok(json!({
                "worker_id": self.worker_id,
                "uptime_ms": u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "mode": self.mode.as_str(),
                "commands_handled": self.commands_handled,
            }))),
            "cleanup_session" => Action::Reply(self.cleanup_session(args)),
            "cleanup" => Action::Reply(Ok(self.cleanup_all())),
            "reset_state" => Action::Reply(Ok(self.reset_state())),
            "get_stats" => Action::Reply(Ok(self.stats())),
            "get_session_data" => Action::Reply(self.get_session_data(args)),
            "update_session_data" => Action::Reply(self.update_session_data(args)),
            "shutdown" => Action::ReplyAndExit(json!({"status": "shutting_down"})),
            "put_resource" => Action::Reply(self.put_resource(args)),
            "get_resource" => Action::Reply(self.get_resource(args)),
            "list_resources" => Action::Reply(Ok(self.list_resources(args))),
            "delete_resource" => Action::Reply(self.delete_resource(args)),
            "echo" => Action::Reply(Ok(args.clone())),
            "sleep" => {
                let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
                std::thread::sleep(Duration::from_millis(ms));
                Action::Reply(Ok(json!({ "slept_ms": ms })))
            }
            "crash" => {
                let code = args
                    .get("code")
                    .and_then(Value::as_i64)
                    .and_then(|c| i32::try_from(c).ok())
                    .unwrap_or(1);
                Action::Exit(code)
            }
            "stale_then_reply" => {
                let stale = Response::ok(request.id.wrapping_add(1 << 32), json!({"stale": true}));
                let real = Response::ok(request.id, json!({"stale_skipped": true}));
                let frames = [stale, real]
                    .iter()
                    .filter_map(|r| encode_response(r, DEFAULT_MAX_PAYLOAD_BYTES).ok())
                    .collect();
                Action::Frames(frames)
            }
            "garbage" => match encode_frame(b"{not json", DEFAULT_MAX_PAYLOAD_BYTES) {
                Ok(frame) => Action::Frames(vec![frame]),
                Err(e) => Action::Reply(Err(e.to_string())),
            },
            other => Action::Reply(Err(format!("unknown command: {other}"))),
        }
    }

    fn cleanup_session(&mut self, args: &Value) -> Result<Value, String> {
        let session_id = args
            .get("session_id")
            .and_then(Value::as_str)
            .ok_or_else(|| "cleanup_session requires session_id".to_string())?;

        let before = self.resources.len();
        self.resources.retain(|(session, _), _| session != session_id);
        let removed = before - self.resources.len();
        let keys_removed = self.session_data.remove(session_id).map_or(0, |data| data.len());
        self.cleanups += 1;
        info!(session = %session_id, removed, keys_removed, "Session cleaned up");

        Ok(json!({
            "status": "cleaned",
            "session_id": session_id,
            "resources_removed": removed,
            "keys_removed": keys_removed,
        }))
    }

    /// Drop every session's state
    fn cleanup_all(&mut self) -> Value {
        let resources = self.resources.len();
        let sessions = self.session_ids().len();
        self.resources.clear();
        self.session_data.clear();
        info!(resources, sessions, "Worker state cleaned up");
        json!({
            "status": "cleaned",
            "resources_removed": resources,
            "sessions_removed": sessions,
        })
    }

    /// Drop all state and zero the counters
    fn reset_state(&mut self) -> Value {
        let commands = self.commands_handled;
        let errors = self.errors;
        let cleaned = self.cleanup_all();
        self.commands_handled = 0;
        self.errors = 0;
        self.cleanups = 0;
        json!({
            "status": "reset",
            "resources_cleared": cleaned["resources_removed"],
            "sessions_cleared": cleaned["sessions_removed"],
            "commands_cleared": commands,
            "errors_cleared": errors,
        })
    }

    fn session_ids(&self) -> BTreeSet<&str> {
        self.resources
            .keys()
            .map(|(s, _)| s.as_str())
            .chain(self.session_data.keys().map(String::as_str))
            .collect()
    }

    fn get_session_data(&self, args: &Value) -> Result<Value, String> {
        let session_id = required_session(args, "get_session_data")?;
        let data = self.session_data.get(session_id);

        match args.get("key").and_then(Value::as_str) {
            Some(key) => Ok(json!({
                "session_id": session_id,
                "key": key,
                "value": data.and_then(|d| d.get(key)).cloned().unwrap_or(Value::Null),
            })),
            None => Ok(json!({
                "session_id": session_id,
                "data": data.cloned().unwrap_or_default(),
            })),
        }
    }

    /// `operation`: `set` (default), `delete` or `clear`
    fn update_session_data(&mut self, args: &Value) -> Result<Value, String> {
        let session_id = required_session(args, "update_session_data")?.to_string();
        let operation = args.get("operation").and_then(Value::as_str).unwrap_or("set");
        let key = args.get("key").and_then(Value::as_str);

        let data = self.session_data.entry(session_id.clone()).or_default();
        let applied = match (operation, key) {
            ("set", Some(key)) => {
                let value = args.get("value").cloned().unwrap_or(Value::Null);
                data.insert(key.to_string(), value);
                Ok(())
            }
            ("delete", Some(key)) => {
                data.remove(key);
                Ok(())
            }
            ("clear", _) => {
                data.clear();
                Ok(())
            }
            ("set" | "delete", None) => Err(format!("{operation} requires key")),
            (other, _) => Err(format!("unknown operation: {other}")),
        };

        let keys = data.len();
        if keys == 0 {
            self.session_data.remove(&session_id);
        }
        applied?;
        Ok(json!({
            "session_id": session_id,
            "operation": operation,
            "keys": keys,
        }))
    }

    fn stats(&self) -> Value {
        let sessions = self.session_ids();
        json!({
            "worker_id": self.worker_id,
            "commands_handled": self.commands_handled,
            "errors": self.errors,
            "sessions": sessions.len(),
            "resources": self.resources.len(),
            "cleanups": self.cleanups,
        })
    }

    fn put_resource(&mut self, args: &Value) -> Result<Value, String> {
        let session = session_of(args);
        let resource_id = resource_id_of(args)?;
        let value = args.get("value").cloned().unwrap_or(Value::Null);
        self.resources
            .insert((session.clone(), resource_id.clone()), value);
        Ok(json!({"session_id": session, "resource_id": resource_id, "stored": true}))
    }

    fn get_resource(&self, args: &Value) -> Result<Value, String> {
        let session = session_of(args);
        let resource_id = resource_id_of(args)?;
        self.resources
            .get(&(session, resource_id.clone()))
            .map(|value| json!({"resource_id": resource_id, "value": value}))
            .ok_or_else(|| format!("resource not found: {resource_id}"))
    }

    fn list_resources(&self, args: &Value) -> Value {
        let session = session_of(args);
        let mut ids: Vec<&str> = self
            .resources
            .keys()
            .filter(|(s, _)| *s == session)
            .map(|(_, id)| id.as_str())
            .collect();
        ids.sort_unstable();
        json!({"session_id": session, "resources": ids})
    }

    fn delete_resource(&mut self, args: &Value) -> Result<Value, String> {
        let session = session_of(args);
        let resource_id = resource_id_of(args)?;
        let deleted = self.resources.remove(&(session, resource_id)).is_some();
        Ok(json!({ "deleted": deleted }))
    }
}

fn session_of(args: &Value) -> String {
    args.get("session_id")
        .and_then(Value::as_str)
        .unwrap_or(ANONYMOUS_SESSION)
        .to_string()
}

fn required_session<'a>(args: &'a Value, command: &str) -> Result<&'a str, String> {
    args.get("session_id")
        .and_then(Value::as_str)
        .ok_or_else(|| format!("{command} requires session_id"))
}

fn resource_id_of(args: &Value) -> Result<String, String> {
    args.get("resource_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| "resource_id is required".to_string())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pool_worker=warn".into()),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging();

    if args.startup_delay_ms > 0 {
        std::thread::sleep(Duration::from_millis(args.startup_delay_ms));
    }

    let mut state = WorkerState::new(&args);
    let mut input = BufReader::new(io::stdin().lock());
    let mut output = BufWriter::new(io::stdout().lock());
    info!(worker_id = %state.worker_id, mode = state.mode.as_str(), "Worker ready");

    loop {
        let payload = match read_frame_blocking(&mut input, DEFAULT_MAX_PAYLOAD_BYTES) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!("stdin closed, exiting");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "Failed to read frame, exiting");
                return Ok(());
            }
        };

        let request = match parse_request(&payload) {
            Ok(request) => request,
            Err(e) => {
                // Without an id there is nobody to answer
                warn!(error = %e, "Discarding malformed request");
                state.errors += 1;
                continue;
            }
        };
        debug!(id = request.id, command = %request.command, "Handling request");

        match state.handle(&request) {
            Action::Reply(result) => {
                let response = match result {
                    Ok(value) => Response::ok(request.id, value),
                    Err(message) => {
                        state.errors += 1;
                        Response::error(request.id, message)
                    }
                };
                let frame = encode_response(&response, DEFAULT_MAX_PAYLOAD_BYTES)
                    .or_else(|e| {
                        encode_response(&Response::error(request.id, e.to_string()), DEFAULT_MAX_PAYLOAD_BYTES)
                    })
                    .context("Failed to encode response")?;
                write_frame_blocking(&mut output, &frame).context("Failed to write response")?;
            }
            Action::ReplyAndExit(value) => {
                let frame = encode_response(&Response::ok(request.id, value), DEFAULT_MAX_PAYLOAD_BYTES)
                    .context("Failed to encode response")?;
                write_frame_blocking(&mut output, &frame).context("Failed to write response")?;
                output.flush().context("Failed to flush stdout")?;
                info!("Shutdown requested");
                return Ok(());
            }
            Action::Exit(code) => {
                warn!(code, "Crash requested");
                std::process::exit(code);
            }
            Action::Frames(frames) => {
                for frame in frames {
                    write_frame_blocking(&mut output, &frame).context("Failed to write frame")?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> WorkerState {
        WorkerState::new(&Args {
            worker_id: "worker-1".to_string(),
            mode: Mode::PoolWorker,
            startup_delay_ms: 0,
        })
    }

    fn request(command: &str, args: Value) -> Request {
        Request {
            id: 1,
            command: command.to_string(),
            args,
        }
    }

    fn reply(state: &mut WorkerState, command: &str, args: Value) -> Result<Value, String> {
        match state.handle(&request(command, args)) {
            Action::Reply(result) => result,
            _ => panic!("expected a plain reply"),
        }
    }

    #[test]
    fn test_ping_reports_identity() {
        let mut state = state();
        let pong = reply(&mut state, "ping", Value::Null).unwrap();
        assert_eq!(pong["worker_id"], "worker-1");
        assert_eq!(pong["mode"], "pool-worker");
        assert_eq!(pong["commands_handled"], 1);
    }

    #[test]
    fn test_resources_are_namespaced_by_session() {
        let mut state = state();
        reply(&mut state, "put_resource", json!({"session_id": "a", "resource_id": "m", "value": 1})).unwrap();
        reply(&mut state, "put_resource", json!({"session_id": "b", "resource_id": "m", "value": 2})).unwrap();
        reply(&mut state, "put_resource", json!({"resource_id": "m", "value": 3})).unwrap();

        let a = reply(&mut state, "get_resource", json!({"session_id": "a", "resource_id": "m"})).unwrap();
        let b = reply(&mut state, "get_resource", json!({"session_id": "b", "resource_id": "m"})).unwrap();
        let anon = reply(&mut state, "get_resource", json!({"resource_id": "m"})).unwrap();
        assert_eq!(a["value"], 1);
        assert_eq!(b["value"], 2);
        assert_eq!(anon["value"], 3);
    }

    #[test]
    fn test_cleanup_session_removes_only_that_session() {
        let mut state = state();
        reply(&mut state, "put_resource", json!({"session_id": "a", "resource_id": "x"})).unwrap();
        reply(&mut state, "put_resource", json!({"session_id": "a", "resource_id": "y"})).unwrap();
        reply(&mut state, "put_resource", json!({"session_id": "b", "resource_id": "x"})).unwrap();

        let cleaned = reply(&mut state, "cleanup_session", json!({"session_id": "a"})).unwrap();
        assert_eq!(cleaned["status"], "cleaned");
        assert_eq!(cleaned["resources_removed"], 2);

        let stats = reply(&mut state, "get_stats", Value::Null).unwrap();
        assert_eq!(stats["resources"], 1);
        assert_eq!(stats["cleanups"], 1);
        assert!(reply(&mut state, "cleanup_session", json!({})).is_err());
    }

    #[test]
    fn test_unknown_command_is_error() {
        let mut state = state();
        let err = reply(&mut state, "frobnicate", Value::Null).unwrap_err();
        assert!(err.contains("frobnicate"));
    }

    #[test]
    fn test_stale_then_reply_writes_two_frames() {
        let mut state = state();
        let Action::Frames(frames) = state.handle(&request("stale_then_reply", Value::Null)) else {
            panic!("expected frames");
        };
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_session_data_round_trip() {
        let mut state = state();
        reply(&mut state, "update_session_data", json!({"session_id": "a", "key": "k", "value": 7})).unwrap();
        reply(&mut state, "update_session_data", json!({"session_id": "b", "key": "k", "value": 8})).unwrap();

        let one = reply(&mut state, "get_session_data", json!({"session_id": "a", "key": "k"})).unwrap();
        assert_eq!(one["value"], 7);
        let all = reply(&mut state, "get_session_data", json!({"session_id": "b"})).unwrap();
        assert_eq!(all["data"], json!({"k": 8}));

        reply(&mut state, "update_session_data", json!({"session_id": "a", "operation": "delete", "key": "k"})).unwrap();
        let gone = reply(&mut state, "get_session_data", json!({"session_id": "a", "key": "k"})).unwrap();
        assert_eq!(gone["value"], Value::Null);

        assert!(reply(&mut state, "get_session_data", json!({})).is_err());
        assert!(reply(&mut state, "update_session_data", json!({"session_id": "a"})).is_err());
        assert!(reply(&mut state, "update_session_data", json!({"session_id": "a", "operation": "merge"})).is_err());
    }

    #[test]
    fn test_cleanup_session_drops_session_data() {
        let mut state = state();
        reply(&mut state, "update_session_data", json!({"session_id": "a", "key": "k", "value": 1})).unwrap();
        reply(&mut state, "update_session_data", json!({"session_id": "b", "key": "k", "value": 2})).unwrap();

        let cleaned = reply(&mut state, "cleanup_session", json!({"session_id": "a"})).unwrap();
        assert_eq!(cleaned["keys_removed"], 1);
        let stats = reply(&mut state, "get_stats", Value::Null).unwrap();
        assert_eq!(stats["sessions"], 1);
    }

    #[test]
    fn test_cleanup_and_reset_drop_everything() {
        let mut state = state();
        reply(&mut state, "put_resource", json!({"session_id": "a", "resource_id": "x"})).unwrap();
        reply(&mut state, "update_session_data", json!({"session_id": "b", "key": "k", "value": 1})).unwrap();

        let cleaned = reply(&mut state, "cleanup", Value::Null).unwrap();
        assert_eq!(cleaned["resources_removed"], 1);
        assert_eq!(cleaned["sessions_removed"], 2);

        reply(&mut state, "put_resource", json!({"session_id": "a", "resource_id": "y"})).unwrap();
        state.errors += 1;
        let reset = reply(&mut state, "reset_state", Value::Null).unwrap();
        assert_eq!(reset["status"], "reset");
        assert_eq!(reset["resources_cleared"], 1);
        assert_eq!(reset["errors_cleared"], 1);

        let stats = reply(&mut state, "get_stats", Value::Null).unwrap();
        assert_eq!(stats["resources"], 0);
        assert_eq!(stats["errors"], 0);
        assert_eq!(stats["commands_handled"], 1);
    }
}
