//! lazyd - CLI entry point
//!
//! Without a subcommand, lazyd acts as a client: it connects to the background
//! service (starting it if needed), queries it, and prints the answers. The
//! `serve` subcommand runs the service itself and is normally invoked only by
//! the client.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::runtime::Runtime;

use lazyd::client::{connect_or_start, Client, ClientError};
use lazyd::daemon::{self, ExitReason, ServiceError, ServiceState};
use lazyd::protocol::{Request, Response};
use lazyd::{logging, parse_ttl, LogDestination, ServiceConfig, DEFAULT_ADDR};

/// Lazily started, self-expiring background service
#[derive(Parser)]
#[command(name = "lazyd")]
#[command(version, about = "Lazily started, self-expiring background service")]
struct Cli {
    /// How long the service stays alive without any connection activity
    #[arg(long, global = true, default_value = "5s", value_parser = parse_ttl)]
    ttl: Duration,

    /// Service log file; service logs are discarded when unset
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    /// Service address
    #[arg(long, global = true, hide = true, default_value_t = DEFAULT_ADDR)]
    addr: SocketAddr,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available subcommands for the lazyd CLI
#[derive(Subcommand)]
enum Commands {
    /// Run the background service
    Serve {
        /// Leave the launching session so the service outlives its launcher
        #[arg(long)]
        detach: bool,
    },
}

fn main() -> ExitCode {
    // Parse CLI arguments BEFORE any runtime operations
    let cli = Cli::parse();
    let config =
        ServiceConfig::new(cli.addr, cli.ttl).with_log(LogDestination::from_option(cli.log));

    match cli.command {
        Some(Commands::Serve { detach }) => run_serve(config, detach),
        None => run_client(config),
    }
}

fn run_serve(config: ServiceConfig, detach: bool) -> ExitCode {
    ExitCode::from(serve_exit_status(&daemon::run_service(config, detach)))
}

/// Maps the outcome of a service run to its process exit status.
fn serve_exit_status(outcome: &Result<ExitReason, ServiceError>) -> u8 {
    match outcome {
        Ok(ExitReason::IdleTimeout) => 0,
        Ok(ExitReason::AcceptFailed(_)) => 1,
        // Losing the startup race is the expected outcome for all but one service.
        Err(e) if e.is_bind_conflict() => 0,
        Err(_) => 1,
    }
}

fn run_client(config: ServiceConfig) -> ExitCode {
    logging::init_client();

    let runtime = match Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to create tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async {
        let client = connect_or_start(&config).await.into_client();
        let (version, count) = query(client).await;
        println!("version: {version}");
        println!("n reqs: {count}");
        ExitCode::SUCCESS
    })
}

/// Queries the service, or a local state when there is no usable service.
///
/// A service can hit its idle deadline right after accepting our connection,
/// so a failed query falls back the same way a failed bootstrap does.
async fn query(client: Option<Client>) -> (String, u64) {
    match client {
        Some(mut client) => match query_service(&mut client).await {
            Ok(report) => return report,
            Err(e) => tracing::warn!(error = %e, "service query failed; answering locally"),
        },
        None => tracing::warn!("answering locally without a service"),
    }
    query_local().await
}

async fn query_service(client: &mut Client) -> Result<(String, u64), ClientError> {
    let version = client.version().await?;
    let count = client.request_count().await?;
    Ok((version, count))
}

/// Answers the same queries from a private, short-lived state.
async fn query_local() -> (String, u64) {
    let state = ServiceState::new();
    let version = match state.handle(Request::Version).await {
        Response::Version { version } => version,
        _ => lazyd::protocol::VERSION.to_string(),
    };
    let count = match state.handle(Request::Requests).await {
        Response::Requests { count } => count,
        _ => state.request_count().await,
    };
    (version, count)
}
