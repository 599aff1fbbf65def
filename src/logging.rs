//! Logging initialization.
//!
//! Configures the `tracing` subscriber with level filtering via the
//! `LAZYD_LOG` environment variable.
//!
//! The client logs to stderr and defaults to `warn`, so a normal invocation
//! prints nothing but its results. The service never logs to stdout, which
//! carries the readiness line: it appends to the `--log` file (default level
//! `info`) or installs no subscriber at all when logs are discarded.
//!
//! # Usage
//!
//! ```bash
//! # Debug the bootstrap protocol from the client side
//! LAZYD_LOG=debug lazyd
//!
//! # Keep a service log
//! lazyd --log /tmp/lazyd.log
//! ```

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::{fmt, EnvFilter};

use crate::daemon::ServiceError;
use crate::LogDestination;

/// Environment variable holding filter directives.
pub const LOG_ENV: &str = "LAZYD_LOG";

fn filter(default: &str) -> EnvFilter {
    filter_from(std::env::var(LOG_ENV).ok().as_deref(), default)
}

/// Builds a filter from `directives`, falling back to `default` when they are
/// missing or do not parse.
fn filter_from(directives: Option<&str>, default: &str) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(default))
}

/// Initialize logging for client mode.
///
/// Does nothing if a global subscriber is already installed.
pub fn init_client() {
    let _ = fmt()
        .with_env_filter(filter("warn"))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Initialize logging for service mode.
///
/// # Errors
///
/// Returns [`ServiceError::Log`] if the log file cannot be opened for
/// appending.
pub fn init_service(destination: &LogDestination) -> Result<(), ServiceError> {
    let LogDestination::File(path) = destination else {
        return Ok(());
    };

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| ServiceError::Log {
            path: path.clone(),
            source,
        })?;

    let _ = fmt()
        .with_env_filter(filter("info"))
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn default_level_applies_without_directives() {
        assert_eq!(filter_from(None, "warn").max_level_hint(), Some(LevelFilter::WARN));
        assert_eq!(filter_from(None, "info").max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn directives_override_default_level() {
        let filter = filter_from(Some("debug"), "warn");
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));

        let filter = filter_from(Some("lazyd=trace"), "warn");
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
    }

    #[test]
    fn invalid_directives_fall_back_to_default() {
        let filter = filter_from(Some("lazyd=verbose"), "warn");
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::WARN));
    }

    #[test]
    fn discard_needs_no_file() {
        assert!(init_service(&LogDestination::Discard).is_ok());
    }

    #[test]
    fn unwritable_log_path_is_reported() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let path = dir.path().join("missing").join("lazyd.log");
        let err = init_service(&LogDestination::File(path.clone())).unwrap_err();
        assert!(matches!(err, ServiceError::Log { path: p, .. } if p == path));
    }

    #[test]
    fn log_file_is_created() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let path: PathBuf = dir.path().join("lazyd.log");
        init_service(&LogDestination::File(path.clone())).unwrap();
        assert!(path.exists());
    }
}
