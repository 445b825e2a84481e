// ABOUTME: Main entry point for the poolbridge operator CLI
//
// Binary: poolbridge
// Usage: poolbridge [--config PATH] [--format text|json] [--log-json] <COMMAND>
// - exec: run one command on a pooled worker
// - status: print the pool status surface
// - serve: JSON lines on stdin, one response line per request on stdout
//
// Logs go to stderr; stdout carries command output only.

#![allow(missing_docs)]

use anyhow::Result;
use clap::Parser;

mod cli;

use poolbridge::bridge;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    setup_logging(args.log_json);
    setup_panic_handler();

    let config = args.load_config()?;

    match args.command {
        cli::Commands::Exec(exec_args) => cli::exec::execute(exec_args, config, args.format).await,
        cli::Commands::Status => cli::status::execute(config, args.format).await,
        cli::Commands::Serve(serve_args) => cli::serve::execute(serve_args, config).await,
    }
}

fn setup_logging(json: bool) {
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "poolbridge=info".into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn setup_panic_handler() {
    use tracing::error;

    std::panic::set_hook(Box::new(|panic_info| {
        error!("poolbridge panicked: {}", panic_info);
        eprintln!("poolbridge panicked: {}", panic_info);
    }));
}
