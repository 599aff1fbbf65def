//! Wire types for the service's request/response protocol.
//!
//! Messages are newline-delimited JSON, one request per line and one response
//! per request:
//!
//! ```text
//! -> {"method":"requests"}
//! <- {"result":"requests","count":3}
//! ```

use serde::{Deserialize, Serialize};

/// Version string reported by the service.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A request sent by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    /// Ask for the service version.
    Version,
    /// Ask how many requests the service has served, including this one.
    Requests,
    /// Ask for the service's process id.
    Pid,
}

/// A reply to a single [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    /// Reply to [`Request::Version`].
    Version { version: String },
    /// Reply to [`Request::Requests`].
    Requests { count: u64 },
    /// Reply to [`Request::Pid`].
    Pid { pid: u32 },
    /// The request line could not be understood.
    Error { message: String },
}

/// Encodes a message as one JSON line, newline included.
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decodes one line, ignoring surrounding whitespace.
pub fn decode_line<'a, T: Deserialize<'a>>(line: &'a str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim())
}
