//! Idle-timeout supervisor.
//!
//! The supervisor binds the service address, reports readiness, hands the
//! listener to a background accept loop, and then waits. Each activity event
//! re-arms a deadline of one full TTL; when the deadline passes without any
//! event, the accept loop and all of its connections are dropped and
//! [`Supervisor::run`] returns.
//!
//! ```text
//! Starting --bind ok--> Listening --> IdleWait --deadline--> Terminated
//!     |                                  ^  |
//!     +--bind failed--> Terminated       +--+ activity
//! ```

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;

use crate::daemon::activity;
use crate::daemon::server::{Listener, Server};
use crate::daemon::state::ServiceState;
use crate::daemon::ServiceError;
use crate::readiness::ReadinessSender;

/// Lifecycle phase of a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Binding the service address.
    Starting,
    /// Bound; readiness is being reported.
    Listening,
    /// Serving connections and waiting for the idle deadline.
    IdleWait,
    /// Finished. No further connections are accepted.
    Terminated,
}

/// Why a supervisor that reached `Listening` stopped.
#[derive(Debug)]
pub enum ExitReason {
    /// A full TTL passed with no connection activity.
    IdleTimeout,
    /// The listener failed after the service was up.
    AcceptFailed(io::Error),
}

impl ExitReason {
    /// Whether this is the normal end of a service's life.
    pub fn is_idle_timeout(&self) -> bool {
        matches!(self, ExitReason::IdleTimeout)
    }
}

/// Owns the listener and the idle deadline of one service instance.
#[derive(Debug)]
pub struct Supervisor {
    ttl: Duration,
    state_tx: watch::Sender<SupervisorState>,
}

impl Supervisor {
    /// Creates a supervisor that gives up after `ttl` without activity.
    pub fn new(ttl: Duration) -> Self {
        let (state_tx, _) = watch::channel(SupervisorState::Starting);
        Self { ttl, state_tx }
    }

    /// Subscribes to lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    fn transition(&self, next: SupervisorState) {
        let previous = self.state_tx.send_replace(next);
        tracing::debug!(from = ?previous, to = ?next, "supervisor transition");
    }

    /// Binds `addr`, reports readiness, and serves until idle.
    ///
    /// The readiness line is written only after the bind succeeded and before
    /// the first connection is accepted. A failed bind is reported on
    /// `readiness` instead and returned as [`ServiceError::Bind`].
    pub async fn run(
        self,
        addr: SocketAddr,
        readiness: ReadinessSender,
        state: ServiceState,
    ) -> Result<ExitReason, ServiceError> {
        self.transition(SupervisorState::Starting);

        let server = match Server::bind(addr, state).await {
            Ok(server) => server,
            Err(source) => {
                let report = if source.kind() == io::ErrorKind::AddrInUse {
                    tracing::info!(%addr, "service address already taken, exiting");
                    readiness.bind_conflict(&source.to_string()).await
                } else {
                    tracing::error!(%addr, error = %source, "failed to bind service address");
                    readiness
                        .fail(&format!("failed to listen on {addr}: {source}"))
                        .await
                };
                if let Err(e) = report {
                    tracing::warn!(error = %e, "could not report startup failure");
                }
                self.transition(SupervisorState::Terminated);
                return Err(ServiceError::Bind { addr, source });
            }
        };

        Ok(self.supervise(server, readiness).await)
    }

    /// Reports readiness for an already bound `server` and serves until idle.
    ///
    /// Returns early with [`ExitReason::AcceptFailed`] if the listener fails;
    /// the accept is never retried.
    pub async fn supervise<L: Listener>(
        self,
        server: Server<L>,
        readiness: ReadinessSender,
    ) -> ExitReason {
        self.transition(SupervisorState::Listening);
        tracing::info!(addr = ?server.local_addr().ok(), ttl = ?self.ttl, "service listening");
        if let Err(e) = readiness.ready().await {
            // The launcher may have given up on us; other clients can still connect.
            tracing::warn!(error = %e, "could not report readiness");
        }

        let (tracker, mut monitor) = activity::channel();
        let mut accept = tokio::spawn(server.accept_loop(tracker));
        self.transition(SupervisorState::IdleWait);

        let reason = loop {
            tokio::select! {
                Some(()) = monitor.next() => {
                    tracing::trace!("activity, idle deadline reset");
                }
                _ = sleep(self.ttl) => {
                    tracing::info!(ttl = ?self.ttl, "no activity within ttl, terminating");
                    // In-flight connections are dropped with the accept loop.
                    accept.abort();
                    let _ = (&mut accept).await;
                    break ExitReason::IdleTimeout;
                }
                joined = &mut accept => {
                    let error = joined.unwrap_or_else(io::Error::other);
                    tracing::error!(error = %error, "accept loop stopped, terminating");
                    break ExitReason::AcceptFailed(error);
                }
            }
        };

        self.transition(SupervisorState::Terminated);
        reason
    }
}
