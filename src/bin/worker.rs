//! Taskmill worker binary.
//!
//! Attaches to the channel named on the command line, runs the request
//! through the script runner, and exits. One process per task.
//!
//! Usage:
//!   taskmill-worker --channel /taskmill-1234-00deadbeef000000

use clap::Parser;
use std::process::ExitCode;

use taskmill::worker::{ScriptRunner, WorkerShim};

#[derive(Parser)]
#[command(name = "taskmill-worker")]
#[command(about = "Taskmill worker - runs one task attached to a shared-memory channel")]
#[command(version)]
struct Cli {
    /// Name of the channel to attach to.
    #[arg(long)]
    channel: String,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&cli.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let shim = match WorkerShim::attach(&cli.channel) {
        Ok(shim) => shim,
        Err(e) => {
            eprintln!("error: could not attach to channel {}: {e}", cli.channel);
            return ExitCode::FAILURE;
        }
    };

    match shim.run(&mut ScriptRunner) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: task channel failed: {e}");
            ExitCode::FAILURE
        }
    }
}
