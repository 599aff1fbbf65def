//! Service side of lazyd.
//!
//! This module provides the process entry point for `lazyd serve`: detaching
//! from the launcher's session, setting up logging, and running the
//! [`Supervisor`] until the service has been idle for a full TTL.

pub mod activity;
pub mod server;
pub mod state;
pub mod supervisor;

pub use server::{Listener, Server};
pub use state::ServiceState;
pub use supervisor::{ExitReason, Supervisor, SupervisorState};

use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;

use fork::Fork;
use thiserror::Error;
use tokio::runtime::Runtime;
use tracing::info;

use crate::logging;
use crate::readiness::{ReadinessSender, ERROR_PREFIX};
use crate::ServiceConfig;

/// Failures that keep a service from ever reaching `Listening`.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The service address could not be bound.
    #[error("failed to listen on {addr}")]
    Bind {
        /// Address that was requested.
        addr: SocketAddr,
        /// Underlying bind error.
        #[source]
        source: io::Error,
    },

    /// The log file could not be opened.
    #[error("failed to open log file {}", path.display())]
    Log {
        /// Path of the log file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Leaving the launcher's session failed.
    #[error("failed to detach from the launching session: {0}")]
    Detach(String),

    /// The async runtime could not be created.
    #[error("failed to create tokio runtime")]
    Runtime(#[source] io::Error),
}

impl ServiceError {
    /// Whether another process already owns the service address.
    pub fn is_bind_conflict(&self) -> bool {
        matches!(self, ServiceError::Bind { source, .. } if source.kind() == io::ErrorKind::AddrInUse)
    }
}

/// Detaches the current process from the launcher's session.
///
/// The service must outlive the command that started it, including a Ctrl+C
/// delivered to that command's process group. `setsid()` gives the service
/// its own session without forking, so stdout stays connected to the
/// launcher for the readiness line.
///
/// A process group leader, such as `lazyd serve --detach` typed into a job
/// control shell, may not start a session. In that case the process forks
/// once: the parent exits with status 0 and the child, which inherits
/// stdout, continues as the service.
///
/// # Note
///
/// This function MUST be called BEFORE starting the Tokio runtime.
pub fn detach_process() -> Result<(), ServiceError> {
    if fork::setsid().is_err() {
        match fork::fork() {
            Ok(Fork::Child) => {
                fork::setsid()
                    .map_err(|e| ServiceError::Detach(format!("setsid failed: {e:?}")))?;
            }
            Ok(Fork::Parent(_)) => std::process::exit(0),
            Err(e) => return Err(ServiceError::Detach(format!("fork failed: {e:?}"))),
        }
    }
    std::env::set_current_dir("/").map_err(|e| ServiceError::Detach(e.to_string()))?;
    Ok(())
}

/// Runs one service instance on the current runtime.
///
/// Used by the `serve` entry point and by in-process spawners.
pub async fn serve(
    config: &ServiceConfig,
    readiness: ReadinessSender,
) -> Result<ExitReason, ServiceError> {
    Supervisor::new(config.ttl)
        .run(config.addr, readiness, ServiceState::new())
        .await
}

/// Entry point for `lazyd serve`.
///
/// Reports startup failures on stdout as the readiness line, then returns
/// them so the caller can pick an exit code.
pub fn run_service(config: ServiceConfig, detach: bool) -> Result<ExitReason, ServiceError> {
    if detach {
        if let Err(e) = detach_process() {
            report_sync(&e);
            return Err(e);
        }
    }

    let runtime = Runtime::new().map_err(|e| {
        let err = ServiceError::Runtime(e);
        report_sync(&err);
        err
    })?;

    runtime.block_on(async {
        let readiness = ReadinessSender::stdout();
        if let Err(e) = logging::init_service(&config.log) {
            if let Err(report) = readiness.fail(&e.to_string()).await {
                tracing::warn!(error = %report, "could not report startup failure");
            }
            return Err(e);
        }

        info!(
            addr = %config.addr,
            ttl = %humantime::format_duration(config.ttl),
            detach,
            pid = std::process::id(),
            "lazyd service starting"
        );
        let reason = serve(&config, readiness).await;
        info!(?reason, "lazyd service stopped");
        reason
    })
}

/// Writes a failure readiness line without an async runtime.
fn report_sync(err: &ServiceError) {
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{ERROR_PREFIX}{err}");
    let _ = stdout.flush();
}
