//! Lazily started, self-expiring background service.
//!
//! A short-lived command calls [`client::connect_or_start`] to reach a warm
//! background service. If nothing is listening on the service address, the
//! command re-executes itself in `serve` mode, waits for the new process to
//! report readiness, and connects. The service exits on its own once no
//! connection has produced any traffic for the configured TTL.
//!
//! # Platform Support
//!
//! This crate currently supports **Unix-like systems only** (Linux, macOS).
//!
//! Unix-specific features used:
//! - `setsid()` to detach the service from the caller's session
//! - process exit as the end of the service lifecycle

pub mod client;
pub mod daemon;
pub mod logging;
pub mod protocol;
pub mod readiness;

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

/// Address both the launcher and the service agree on.
pub const DEFAULT_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 63419));

/// Line a freshly started service writes once its listener is bound.
pub const READY_TOKEN: &str = "READY";

/// Default idle lifetime of a service instance.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

/// Default upper bound on how long a launcher waits for the readiness line.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the service writes its log output.
///
/// Stdout is reserved for the readiness line, so the service either appends
/// to a file or drops log records entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LogDestination {
    /// Drop all log output.
    #[default]
    Discard,
    /// Append to the file at this path, creating it if needed.
    File(PathBuf),
}

impl LogDestination {
    /// Builds a destination from an optional `--log` value.
    pub fn from_option(path: Option<PathBuf>) -> Self {
        match path {
            Some(path) if !path.as_os_str().is_empty() => LogDestination::File(path),
            _ => LogDestination::Discard,
        }
    }

    /// Resolves a relative log path against the current directory.
    ///
    /// A detached service changes its working directory to `/`, so the
    /// launcher has to hand over an absolute path.
    pub fn absolutize(self) -> io::Result<Self> {
        match self {
            LogDestination::File(path) if path.is_relative() => {
                Ok(LogDestination::File(std::env::current_dir()?.join(path)))
            }
            other => Ok(other),
        }
    }

    /// Returns the file path, if logging to a file.
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            LogDestination::File(path) => Some(path),
            LogDestination::Discard => None,
        }
    }
}

/// Configuration shared by the launcher and the service it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Address the service listens on and the launcher dials.
    pub addr: SocketAddr,
    /// How long the service stays alive without any connection traffic.
    pub ttl: Duration,
    /// Service log destination.
    pub log: LogDestination,
}

impl ServiceConfig {
    /// Creates a config for `addr` with the given TTL, discarding logs.
    pub fn new(addr: SocketAddr, ttl: Duration) -> Self {
        Self {
            addr,
            ttl,
            log: LogDestination::Discard,
        }
    }

    /// Replaces the log destination.
    pub fn with_log(mut self, log: LogDestination) -> Self {
        self.log = log;
        self
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ADDR, DEFAULT_TTL)
    }
}

/// Parses a TTL such as `200ms` or `5s`.
///
/// A zero TTL is rejected: the service would exit before any client could
/// reach it.
pub fn parse_ttl(value: &str) -> Result<Duration, String> {
    let ttl = humantime::parse_duration(value).map_err(|e| e.to_string())?;
    if ttl.is_zero() {
        return Err("ttl must be greater than zero".to_string());
    }
    Ok(ttl)
}
