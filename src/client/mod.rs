//! Client side of lazyd.
//!
//! This module provides the bootstrap protocol: connect to a running service,
//! or start one and wait for it to report ready, then connect.
//!
//! # Features
//!
//! - **Lazy start**: the service is spawned only when nothing is listening
//! - **Readiness handshake**: no polling; the spawned service says when it is
//!   ready, bounded by a timeout
//! - **Race-safe**: concurrent launchers converge on the single service that
//!   won the bind
//! - **Never fatal**: without a service the caller gets a degraded
//!   [`Bootstrap`] instead of an error
//!
//! # Usage
//!
//! ```no_run
//! use lazyd::client::connect_or_start;
//! use lazyd::ServiceConfig;
//!
//! # async fn example() {
//! let bootstrap = connect_or_start(&ServiceConfig::default()).await;
//! match bootstrap.into_client() {
//!     Some(mut client) => println!("{:?}", client.request_count().await),
//!     None => println!("working without a service"),
//! }
//! # }
//! ```

pub mod connection;
pub mod spawn;

pub use connection::{
    connect_or_start, Bootstrap, Client, ClientError, Launcher, StartError, Startup,
};
pub use spawn::{InProcess, SelfExec, ServiceSpawner, SpawnedService};
