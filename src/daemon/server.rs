//! TCP listener, accept loop, and per-connection handler.
//!
//! Each accepted connection is wrapped in an [`ActivityStream`] and served on
//! its own task. The handler speaks the JSON-lines protocol from
//! [`crate::protocol`] until the peer hangs up.
//!
//! # Example
//!
//! ```no_run
//! use lazyd::daemon::activity;
//! use lazyd::daemon::server::Server;
//! use lazyd::daemon::state::ServiceState;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let server = Server::bind(lazyd::DEFAULT_ADDR, ServiceState::new()).await?;
//!     let (tracker, _monitor) = activity::channel();
//!     let err = server.accept_loop(tracker).await;
//!     eprintln!("listener failed: {err}");
//!     Ok(())
//! }
//! ```

use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

use crate::daemon::activity::{ActivitySink, ActivityStream, ActivityTracker};
use crate::daemon::state::ServiceState;
use crate::protocol::{encode_line, Response};

/// A source of incoming connections.
///
/// Implemented for [`TcpListener`]; other implementations let the accept loop
/// run over in-memory transports.
pub trait Listener: Send + 'static {
    /// Connection type produced by [`Listener::poll_accept`].
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Polls for the next incoming connection.
    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<(Self::Stream, SocketAddr)>>;

    /// Returns the address this listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Listener for TcpListener {
    type Stream = TcpStream;

    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>> {
        TcpListener::poll_accept(self, cx)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// A bound service listener.
///
/// Binding is the only arbiter between competing service processes: whoever
/// binds the address first serves it, everyone else gets `AddrInUse`.
#[derive(Debug)]
pub struct Server<L = TcpListener> {
    listener: L,
    state: ServiceState,
}

impl Server<TcpListener> {
    /// Binds `addr`.
    ///
    /// # Errors
    ///
    /// Returns the bind error unchanged, so callers can tell
    /// [`io::ErrorKind::AddrInUse`] apart from other failures.
    pub async fn bind(addr: SocketAddr, state: ServiceState) -> io::Result<Self> {
        tracing::debug!(%addr, "binding service listener");
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_listener(listener, state))
    }
}

impl<L: Listener> Server<L> {
    /// Serves connections from an already bound listener.
    pub fn from_listener(listener: L, state: ServiceState) -> Self {
        Self { listener, state }
    }

    /// Returns the address actually bound.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Returns the shared state handed to every connection.
    pub fn state(&self) -> &ServiceState {
        &self.state
    }

    /// Accepts connections until the listener fails.
    ///
    /// Every connection runs on its own task and reports its traffic to
    /// `tracker`. Accept errors are not retried: the error is returned and the
    /// caller is expected to shut the service down. Dropping the returned
    /// future aborts every connection task it started.
    pub async fn accept_loop(self, tracker: ActivityTracker) -> io::Error {
        let Self {
            mut listener,
            state,
        } = self;
        let mut connections = JoinSet::new();
        tracing::info!("accepting connections");

        loop {
            tokio::select! {
                accepted = poll_fn(|cx| listener.poll_accept(cx)) => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "accepted connection");
                        let state = state.clone();
                        let sink = tracker.clone();
                        connections.spawn(async move {
                            if let Err(e) = serve_connection(stream, sink, state).await {
                                tracing::warn!(%peer, error = %e, "connection ended with error");
                            } else {
                                tracing::debug!(%peer, "connection closed");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                        return e;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    }
}

/// Serves one connection until EOF or an I/O error.
///
/// Every successful read and write on `stream` records an activity event on
/// `sink` before control returns to the protocol code. A line that is not
/// UTF-8 gets an error response like any other malformed request.
pub async fn serve_connection<S, A>(stream: S, sink: A, state: ServiceState) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    A: ActivitySink + Unpin,
{
    let mut stream = BufReader::new(ActivityStream::new(stream, sink));
    let mut line = Vec::new();

    loop {
        line.clear();
        if stream.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }

        let response = match std::str::from_utf8(&line) {
            Ok(text) if text.trim().is_empty() => continue,
            Ok(text) => state.handle_line(text).await,
            Err(e) => {
                tracing::debug!(error = %e, "rejecting non-UTF-8 request");
                Response::Error {
                    message: format!("invalid request: {e}"),
                }
            }
        };
        let reply = encode_line(&response).map_err(io::Error::other)?;
        stream.write_all(reply.as_bytes()).await?;
        stream.flush().await?;
    }
}
