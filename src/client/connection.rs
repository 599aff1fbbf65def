//! Client connection with lazy-start capability.
//!
//! [`Launcher::connect_or_start`] tries the service address once. If nothing
//! answers, it starts a service through its [`ServiceSpawner`], waits for the
//! readiness line, and tries exactly once more. A startup failure never aborts
//! the bootstrap: a concurrent launcher may have won the race and the second
//! attempt will find its service.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::client::spawn::{SelfExec, ServiceSpawner};
use crate::protocol::{decode_line, encode_line, Request, Response};
use crate::readiness::ReadinessError;
use crate::{ServiceConfig, DEFAULT_READY_TIMEOUT};

/// Error types for requests on an established connection.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Reading from or writing to the service failed.
    #[error("connection to service failed")]
    Io(#[from] io::Error),

    /// The service sent a line that is not a valid response.
    #[error("invalid response from service")]
    Decode(#[from] serde_json::Error),

    /// The service closed the connection before answering.
    #[error("service closed the connection")]
    Closed,

    /// The service answered with an error response.
    #[error("service rejected the request: {0}")]
    Rejected(String),

    /// The service answered with a response of the wrong kind.
    #[error("unexpected response to {request:?}: {response:?}")]
    Unexpected {
        /// Request that was sent.
        request: Request,
        /// Response that came back.
        response: Response,
    },
}

/// Why starting a service did not produce a ready service.
#[derive(Debug, Error)]
pub enum StartError {
    /// The spawner could not start the service at all.
    #[error("failed to spawn service")]
    Spawn(#[source] io::Error),

    /// The service started but did not report readiness.
    #[error(transparent)]
    Readiness(#[from] ReadinessError),
}

impl StartError {
    /// Whether the spawned service lost the race for the service address.
    pub fn is_bind_conflict(&self) -> bool {
        matches!(self, StartError::Readiness(e) if e.is_bind_conflict())
    }
}

/// Client for communicating with a running service.
///
/// # Example
///
/// ```no_run
/// use lazyd::client::Client;
///
/// # async fn example() -> Result<(), lazyd::client::ClientError> {
/// let mut client = Client::connect(lazyd::DEFAULT_ADDR).await?;
/// println!("version: {}", client.version().await?);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Client {
    stream: BufReader<TcpStream>,
}

impl Client {
    /// Creates a `Client` from an established connection.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Connects directly to `addr`, without starting anything.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        TcpStream::connect(addr).await.map(Self::new)
    }

    /// Returns the address of the service this client talks to.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.get_ref().peer_addr()
    }

    /// Sends one request and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Rejected`] if the service answered with an
    /// error response.
    pub async fn call(&mut self, request: Request) -> Result<Response, ClientError> {
        let line = encode_line(&request)?;
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.flush().await?;

        let mut reply = String::new();
        if self.stream.read_line(&mut reply).await? == 0 {
            return Err(ClientError::Closed);
        }
        match decode_line(&reply)? {
            Response::Error { message } => Err(ClientError::Rejected(message)),
            response => Ok(response),
        }
    }

    /// Asks for the service version.
    pub async fn version(&mut self) -> Result<String, ClientError> {
        match self.call(Request::Version).await? {
            Response::Version { version } => Ok(version),
            response => Err(unexpected(Request::Version, response)),
        }
    }

    /// Asks how many requests the service has served, this one included.
    pub async fn request_count(&mut self) -> Result<u64, ClientError> {
        match self.call(Request::Requests).await? {
            Response::Requests { count } => Ok(count),
            response => Err(unexpected(Request::Requests, response)),
        }
    }

    /// Asks for the service's process id.
    pub async fn pid(&mut self) -> Result<u32, ClientError> {
        match self.call(Request::Pid).await? {
            Response::Pid { pid } => Ok(pid),
            response => Err(unexpected(Request::Pid, response)),
        }
    }
}

fn unexpected(request: Request, response: Response) -> ClientError {
    ClientError::Unexpected { request, response }
}

/// What happened to the launcher's own startup attempt.
#[derive(Debug)]
pub enum Startup {
    /// A service was already running; nothing was spawned.
    NotNeeded,
    /// The spawned service reported readiness.
    Ready,
    /// The spawned service did not become ready.
    Failed(StartError),
}

/// Outcome of [`Launcher::connect_or_start`].
///
/// Bootstrap never fails hard: without a client, the caller is expected to
/// carry on without a service.
#[derive(Debug)]
pub struct Bootstrap {
    /// Connection to the service, if one could be reached.
    pub client: Option<Client>,
    /// Result of the startup attempt.
    pub startup: Startup,
}

impl Bootstrap {
    /// Whether a connection was established.
    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Whether this bootstrap spawned a service.
    pub fn spawned(&self) -> bool {
        !matches!(self.startup, Startup::NotNeeded)
    }

    /// Returns the connection, if any.
    pub fn into_client(self) -> Option<Client> {
        self.client
    }
}

/// Client-side bootstrap: connect to the service, starting it if needed.
#[derive(Debug, Clone)]
pub struct Launcher<S = SelfExec> {
    config: ServiceConfig,
    spawner: S,
    ready_timeout: Duration,
}

impl Launcher<SelfExec> {
    /// Launcher that re-executes the current binary.
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_spawner(config, SelfExec::current_exe())
    }
}

impl<S: ServiceSpawner> Launcher<S> {
    /// Launcher that starts services through `spawner`.
    pub fn with_spawner(config: ServiceConfig, spawner: S) -> Self {
        Self {
            config,
            spawner,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    /// Sets how long to wait for a spawned service's readiness line.
    pub fn ready_timeout(mut self, limit: Duration) -> Self {
        self.ready_timeout = limit;
        self
    }

    /// Connects to the service, starting one if none is running.
    ///
    /// 1. Try to connect. On success, return without spawning.
    /// 2. Spawn a service and wait for its readiness line.
    /// 3. Try to connect exactly once more, whatever step 2 reported.
    ///
    /// # Race Condition Handling
    ///
    /// Several launchers may spawn services at the same time. Only one of
    /// those services can bind the address; the others report a bind
    /// conflict and exit. Every launcher still connects in step 3, to
    /// whichever service won.
    pub async fn connect_or_start(&self) -> Bootstrap {
        let addr = self.config.addr;
        match Client::connect(addr).await {
            Ok(client) => {
                tracing::debug!(%addr, "connected to running service");
                return Bootstrap {
                    client: Some(client),
                    startup: Startup::NotNeeded,
                };
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "no service running, starting one");
            }
        }

        let startup = match self.start_service().await {
            Ok(()) => Startup::Ready,
            Err(e) => {
                if e.is_bind_conflict() {
                    tracing::debug!("another launcher's service won the bind race");
                } else {
                    tracing::warn!(error = %e, "service failed to start");
                }
                Startup::Failed(e)
            }
        };

        let client = match Client::connect(addr).await {
            Ok(client) => {
                tracing::debug!(%addr, "connected to service");
                Some(client)
            }
            Err(e) => {
                tracing::warn!(%addr, error = %e, "no service available; proceeding without one");
                None
            }
        };

        Bootstrap { client, startup }
    }

    /// Spawns a service and waits for its readiness line.
    ///
    /// # Errors
    ///
    /// Returns [`StartError::Spawn`] if nothing could be started and
    /// [`StartError::Readiness`] if the service did not report ready in time.
    pub async fn start_service(&self) -> Result<(), StartError> {
        let spawned = self
            .spawner
            .spawn(&self.config)
            .map_err(StartError::Spawn)?;
        spawned.wait_ready(self.ready_timeout).await?;
        tracing::info!(addr = %self.config.addr, "service reported ready");
        Ok(())
    }
}

/// Connects to the service described by `config`, re-executing the current
/// binary to start it when needed.
pub async fn connect_or_start(config: &ServiceConfig) -> Bootstrap {
    Launcher::new(config.clone()).connect_or_start().await
}

#[cfg(test)]
mod tests;
