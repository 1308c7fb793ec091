//! Deadline-bounded fetches over leased relay connections.
//!
//! A [`RelaySession`] belongs to one resolution. Every relay it connects to
//! stays leased until the session is dropped, so later phases of the same
//! resolution reuse the connection and concurrent resolutions sharing the
//! manager never close a relay out from under each other.

use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::connection::ConnectionManager;
use crate::client::{RelayClient, RelayError};
use crate::event::{Event, EventFilter};

/// Events gathered by [`RelaySession::fetch`].
#[derive(Debug, Default)]
pub struct Fetched {
    pub events: Vec<Event>,
    /// Relays that connected and answered before the deadline.
    pub answered: usize,
    /// The deadline passed with relays still pending.
    pub timed_out: bool,
}

/// Relay leases held by one resolution. Dropping the session releases them.
pub struct RelaySession<C: RelayClient> {
    manager: ConnectionManager<C>,
    leased: Mutex<Vec<String>>,
}

impl<C: RelayClient> ConnectionManager<C> {
    /// Start a session whose leases are released when it is dropped.
    pub fn session(&self) -> RelaySession<C> {
        RelaySession {
            manager: self.clone(),
            leased: Mutex::new(Vec::new()),
        }
    }
}

impl<C: RelayClient> RelaySession<C> {
    /// Connect to every relay and query each one as soon as it is up.
    ///
    /// Connects and queries together are bounded by `timeout`. A relay that
    /// is slow to connect only loses its own answer. Failed relays are
    /// skipped.
    pub async fn fetch(
        &self,
        relays: &[String],
        filter: &EventFilter,
        timeout: Duration,
    ) -> Fetched {
        let deadline = Instant::now() + timeout;
        let mut pending: FuturesUnordered<_> = relays
            .iter()
            .map(|url| self.fetch_one(url, filter, deadline))
            .collect();

        let mut fetched = Fetched::default();
        loop {
            let next = tokio::time::timeout_at(deadline, pending.next()).await;
            match next {
                Ok(Some((_, None))) => {}
                Ok(Some((_, Some(Ok(events))))) => {
                    fetched.answered += 1;
                    fetched.events.extend(events);
                }
                Ok(Some((url, Some(Err(e))))) => {
                    warn!(relay = %url, error = %e, "Relay query failed");
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(
                        pending = pending.len(),
                        timeout_ms = timeout.as_millis() as u64,
                        "Fetch deadline reached"
                    );
                    fetched.timed_out = true;
                    break;
                }
            }
        }
        fetched
    }

    /// `None` when the relay could not be connected.
    async fn fetch_one<'a>(
        &self,
        url: &'a str,
        filter: &EventFilter,
        deadline: Instant,
    ) -> (&'a str, Option<Result<Vec<Event>, RelayError>>) {
        if !self.manager.connect_one(url).await {
            return (url, None);
        }
        self.leased.lock().push(url.to_string());

        let target = [url.to_string()];
        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = self.manager.client().query(&target, filter, remaining).await;
        (url, Some(result))
    }

    /// Relays leased so far, one entry per lease.
    pub fn leased(&self) -> Vec<String> {
        self.leased.lock().clone()
    }
}

impl<C: RelayClient> Drop for RelaySession<C> {
    fn drop(&mut self) {
        let leased = std::mem::take(self.leased.get_mut());
        if !leased.is_empty() {
            self.manager.release(&leased);
        }
    }
}
