//! Relay protocol client seam.
//!
//! The resolver only needs three relay operations: open a connection, run a
//! one-shot query against a set of connected relays, and close a connection.
//! [`RelayClient`] captures exactly that, so the connection manager and the
//! resolver can run against real relays ([`SdkRelayClient`]) or a seeded
//! in-process fake ([`MemoryRelayClient`]).

use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;

use crate::event::{Event, EventFilter};

pub mod memory;
pub mod sdk;

pub use memory::MemoryRelayClient;
pub use sdk::SdkRelayClient;

/// Transport-level relay failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("relay query failed: {0}")]
    Query(String),

    #[error("relay operation timed out")]
    Timeout,

    #[error("invalid filter: {0}")]
    InvalidFilter(String),
}

/// One-shot relay access used by the connection manager and resolver.
///
/// Futures are boxed so the trait stays object-safe.
pub trait RelayClient: Send + Sync + 'static {
    /// Open (or confirm) a connection to `url`.
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<(), RelayError>>;

    /// Fetch events matching `filter` from `relays`, waiting at most `timeout`.
    ///
    /// Only schema-valid events are returned.
    fn query<'a>(
        &'a self,
        relays: &'a [String],
        filter: &'a EventFilter,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<Event>, RelayError>>;

    /// Close the connection to `url`. Failures are logged, never returned.
    fn disconnect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, ()>;
}
