//! Standalone termcast server binary.

use std::process::ExitCode;

use clap::Parser;
use termcast_core::config;
use termcast_server::RunError;
use tracing::error;

/// termcast daemon: spawns PTY sessions and serves them over HTTP/WebSocket.
#[derive(Parser, Debug)]
#[command(name = "termcastd")]
struct Args {
    /// Override BIND_ADDRESS from the environment (e.g. 0.0.0.0:4024).
    #[arg(long)]
    bind: Option<String>,
}

/// Exit codes (spec.md §6): `0` clean shutdown, `1` configuration error,
/// `2` bind error, `>2` reserved.
fn main() -> ExitCode {
    let args = Args::parse();
    if let Some(bind) = args.bind {
        std::env::set_var("BIND_ADDRESS", bind);
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = config::ensure_loaded();
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start tokio runtime");
            return ExitCode::from(1);
        }
    };

    match rt.block_on(termcast_server::run_server(config)) {
        Ok(()) => ExitCode::from(0),
        Err(e @ RunError::Config(_)) => {
            error!(error = %e, "configuration error");
            ExitCode::from(1)
        }
        Err(e @ RunError::Bind { .. }) => {
            error!(error = %e, "bind error");
            ExitCode::from(2)
        }
        Err(e @ RunError::Runtime(_)) => {
            error!(error = %e, "server error");
            ExitCode::from(1)
        }
    }
}
