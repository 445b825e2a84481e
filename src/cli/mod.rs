// ABOUTME: CLI argument parsing and command routing for poolbridge
//
// Provides command-line interface for:
// - Running one command on a pooled worker (exec)
// - Printing the pool status surface (status)
// - Serving newline-delimited JSON requests over stdin/stdout (serve)

pub mod exec;
pub mod serve;
pub mod status;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::BridgeConfig;

/// Grace period for in-flight leases when a CLI command finishes
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Process-pool bridge - keep worker subprocesses warm and route commands to them
#[derive(Parser)]
#[command(name = "poolbridge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: ./.poolbridge/config.toml, then ~/.poolbridge/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Log as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Worker command line, overriding the configured one
    #[arg(long, global = true)]
    pub worker_cmd: Option<String>,
}

/// Output format for commands
#[derive(Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run one command on a pooled worker
    Exec(ExecArgs),

    /// Start the pool and print its status
    Status,

    /// Serve JSON-lines requests from stdin until EOF
    Serve(ServeArgs),
}

/// Arguments for the exec command
#[derive(clap::Args)]
pub struct ExecArgs {
    /// Worker command name
    pub command: String,

    /// Arguments as a JSON value
    #[arg(long)]
    pub args: Option<String>,

    /// Session to run under
    #[arg(long)]
    pub session: Option<String>,

    /// Treat the command as idempotent (enables retries)
    #[arg(long)]
    pub idempotent: bool,
}

/// Arguments for the serve command
#[derive(clap::Args)]
pub struct ServeArgs {
    /// How long to wait for in-flight requests after EOF
    #[arg(long, default_value_t = 10_000)]
    pub shutdown_timeout_ms: u64,
}

impl Cli {
    /// Load the configuration and apply command-line overrides
    pub fn load_config(&self) -> Result<BridgeConfig> {
        let mut config =
            BridgeConfig::load(self.config.as_deref()).context("Failed to load configuration")?;

        if let Some(command_line) = &self.worker_cmd {
            let mut parts = command_line.split_whitespace();
            if let Some(program) = parts.next() {
                config.worker.command = program.to_string();
                config.worker.args = parts.map(str::to_string).collect();
            }
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}
