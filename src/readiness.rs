//! One-shot readiness handshake between a spawned service and its launcher.
//!
//! The service writes exactly one line on its stdout (or any designated
//! stream): [`READY_TOKEN`] once its listener is bound, or `ERROR <message>`
//! when startup failed. The launcher reads that single line and nothing else.
//!
//! Receiving the token proves the service address is connectable, because the
//! service only sends it after a successful bind.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::READY_TOKEN;

/// Prefix of every failure line.
pub const ERROR_PREFIX: &str = "ERROR ";

/// Message a service reports when another instance already holds the address.
pub const BIND_CONFLICT: &str = "address in use";

/// Ways the readiness handshake can fail on the launcher side.
#[derive(Debug, Error)]
pub enum ReadinessError {
    /// The stream reached EOF before a complete line arrived.
    #[error("service exited before reporting readiness")]
    Closed,

    /// No line arrived within the allowed window.
    #[error("service did not report readiness within {}", humantime::format_duration(*.0))]
    TimedOut(Duration),

    /// The service reported a startup failure.
    #[error("service failed to start: {0}")]
    Failed(String),

    /// The service wrote something other than a readiness line.
    #[error("unexpected readiness line: {0:?}")]
    Unexpected(String),

    /// Reading the stream failed.
    #[error("failed to read readiness line")]
    Io(#[from] io::Error),
}

impl ReadinessError {
    /// Whether the service lost the race for the service address.
    ///
    /// This is the normal outcome when several launchers start a service at
    /// the same time.
    pub fn is_bind_conflict(&self) -> bool {
        matches!(self, ReadinessError::Failed(message) if message.starts_with(BIND_CONFLICT))
    }
}

/// Service half of the handshake.
///
/// Both signalling methods consume the sender, so at most one line is ever
/// written.
pub struct ReadinessSender {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl ReadinessSender {
    /// Wraps the stream the launcher is reading from.
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Box::new(writer),
        }
    }

    /// Sender writing to this process's stdout.
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    /// Reports that the listener is bound and connections will be served.
    pub async fn ready(self) -> io::Result<()> {
        self.send_line(READY_TOKEN).await
    }

    /// Reports a startup failure.
    ///
    /// Line breaks in `message` are flattened so the report stays one line.
    pub async fn fail(self, message: &str) -> io::Result<()> {
        let flat = message.replace(['\r', '\n'], " ");
        self.send_line(&format!("{ERROR_PREFIX}{flat}")).await
    }

    /// Reports that the service address is already taken.
    pub async fn bind_conflict(self, detail: &str) -> io::Result<()> {
        self.fail(&format!("{BIND_CONFLICT}: {detail}")).await
    }

    async fn send_line(mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }
}

impl std::fmt::Debug for ReadinessSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessSender").finish_non_exhaustive()
    }
}

/// Launcher half of the handshake.
pub struct ReadinessReceiver {
    reader: Box<dyn AsyncBufRead + Send + Unpin>,
}

impl ReadinessReceiver {
    /// Wraps the stream the spawned service reports on.
    pub fn new<R>(reader: R) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
        }
    }

    /// Reads one line and checks it against [`READY_TOKEN`].
    ///
    /// Gives up with [`ReadinessError::TimedOut`] after `limit`.
    pub async fn wait(mut self, limit: Duration) -> Result<(), ReadinessError> {
        let mut line = String::new();
        let read = tokio::time::timeout(limit, self.reader.read_line(&mut line))
            .await
            .map_err(|_| ReadinessError::TimedOut(limit))??;
        if read == 0 {
            return Err(ReadinessError::Closed);
        }
        parse_line(&line)
    }
}

impl std::fmt::Debug for ReadinessReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessReceiver").finish_non_exhaustive()
    }
}

/// Interprets a raw line read from the readiness stream.
///
/// The token must match exactly, including the trailing newline; a line cut
/// short by EOF is never accepted.
pub fn parse_line(line: &str) -> Result<(), ReadinessError> {
    let Some(content) = line.strip_suffix('\n') else {
        return if line.is_empty() {
            Err(ReadinessError::Closed)
        } else {
            Err(ReadinessError::Unexpected(line.to_string()))
        };
    };

    if content == READY_TOKEN {
        Ok(())
    } else if let Some(message) = content.strip_prefix(ERROR_PREFIX) {
        Err(ReadinessError::Failed(message.to_string()))
    } else {
        Err(ReadinessError::Unexpected(content.to_string()))
    }
}
