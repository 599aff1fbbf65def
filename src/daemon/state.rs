//! Shared service state.
//!
//! Every connection handler holds a clone of [`ServiceState`]. All reads and
//! writes of the counters go through one `tokio::sync::Mutex`, so concurrent
//! handlers never observe a torn or lost update.

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::protocol::{decode_line, Request, Response, VERSION};

#[derive(Debug, Default)]
struct Counters {
    requests: u64,
}

/// Request counter shared by all connections of one service instance.
///
/// # Example
///
/// ```
/// use lazyd::daemon::state::ServiceState;
/// use lazyd::protocol::{Request, Response};
///
/// #[tokio::main]
/// async fn main() {
///     let state = ServiceState::new();
///     state.handle(Request::Version).await;
///     let reply = state.handle(Request::Requests).await;
///     assert_eq!(reply, Response::Requests { count: 2 });
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ServiceState {
    counters: Arc<Mutex<Counters>>,
}

impl ServiceState {
    /// Creates state with zero requests served.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves one request, counting it.
    pub async fn handle(&self, request: Request) -> Response {
        let mut counters = self.counters.lock().await;
        counters.requests += 1;
        match request {
            Request::Version => Response::Version {
                version: VERSION.to_string(),
            },
            Request::Requests => Response::Requests {
                count: counters.requests,
            },
            Request::Pid => Response::Pid {
                pid: std::process::id(),
            },
        }
    }

    /// Decodes and serves one protocol line.
    ///
    /// Lines that do not decode produce [`Response::Error`] and are not
    /// counted.
    pub async fn handle_line(&self, line: &str) -> Response {
        match decode_line::<Request>(line) {
            Ok(request) => {
                tracing::debug!(?request, "serving request");
                self.handle(request).await
            }
            Err(e) => {
                tracing::debug!(error = %e, "rejecting malformed request");
                Response::Error {
                    message: format!("invalid request: {e}"),
                }
            }
        }
    }

    /// Returns the number of requests served so far.
    pub async fn request_count(&self) -> u64 {
        self.counters.lock().await.requests
    }
}
