//! In-process [`RelayClient`] holding seeded events.
//!
//! Behaves like a set of well-behaved relays: queries apply NIP-01 filter
//! semantics and return the newest events first. Individual relays can be
//! made unreachable or slow, and every connect attempt is counted so callers
//! can assert on network behavior.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use super::{RelayClient, RelayError};
use crate::event::{Event, EventFilter};

#[derive(Debug, Default)]
struct State {
    /// Events and the relays that hold them (`None` = every relay).
    events: Vec<(Event, Option<HashSet<String>>)>,
    unreachable: HashSet<String>,
    connect_latency: HashMap<String, Duration>,
    connect_attempts: HashMap<String, usize>,
    disconnects: Vec<String>,
    query_count: usize,
    query_delay: Option<Duration>,
    query_error: Option<String>,
}

/// Seeded fake relay network.
#[derive(Debug, Default)]
pub struct MemoryRelayClient {
    state: Mutex<State>,
}

impl MemoryRelayClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `event` available on every relay.
    pub fn add_event(&self, event: Event) {
        self.state.lock().events.push((event, None));
    }

    /// Make `event` available only on `relay`.
    pub fn add_event_on(&self, relay: &str, event: Event) {
        let mut state = self.state.lock();
        if let Some((_, Some(relays))) = state.events.iter_mut().find(|(e, _)| e.id == event.id) {
            relays.insert(relay.to_string());
            return;
        }
        state
            .events
            .push((event, Some(HashSet::from([relay.to_string()]))));
    }

    /// Reject every connect attempt to `relay` (or accept them again).
    pub fn set_unreachable(&self, relay: &str, unreachable: bool) {
        let mut state = self.state.lock();
        if unreachable {
            state.unreachable.insert(relay.to_string());
        } else {
            state.unreachable.remove(relay);
        }
    }

    /// Delay every connect attempt to `relay`.
    pub fn set_connect_latency(&self, relay: &str, latency: Duration) {
        self.state
            .lock()
            .connect_latency
            .insert(relay.to_string(), latency);
    }

    /// Delay every query by `delay`.
    pub fn set_query_delay(&self, delay: Duration) {
        self.state.lock().query_delay = Some(delay);
    }

    /// Fail every query with `reason`.
    pub fn fail_queries(&self, reason: &str) {
        self.state.lock().query_error = Some(reason.to_string());
    }

    /// Number of physical connect attempts made to `relay`.
    pub fn connect_attempts(&self, relay: &str) -> usize {
        self.state
            .lock()
            .connect_attempts
            .get(relay)
            .copied()
            .unwrap_or(0)
    }

    /// Number of queries issued.
    pub fn query_count(&self) -> usize {
        self.state.lock().query_count
    }

    /// Relays disconnected so far, in order.
    pub fn disconnects(&self) -> Vec<String> {
        self.state.lock().disconnects.clone()
    }
}

impl RelayClient for MemoryRelayClient {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<(), RelayError>> {
        Box::pin(async move {
            let latency = {
                let mut state = self.state.lock();
                *state.connect_attempts.entry(url.to_string()).or_default() += 1;
                state.connect_latency.get(url).copied()
            };

            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }

            if self.state.lock().unreachable.contains(url) {
                return Err(RelayError::Connect {
                    url: url.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            Ok(())
        })
    }

    fn query<'a>(
        &'a self,
        relays: &'a [String],
        filter: &'a EventFilter,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<Event>, RelayError>> {
        Box::pin(async move {
            let delay = {
                let mut state = self.state.lock();
                state.query_count += 1;
                state.query_delay
            };

            if let Some(delay) = delay {
                if delay >= timeout {
                    tokio::time::sleep(timeout).await;
                    return Err(RelayError::Timeout);
                }
                tokio::time::sleep(delay).await;
            }

            let state = self.state.lock();
            if let Some(reason) = &state.query_error {
                return Err(RelayError::Query(reason.clone()));
            }

            let mut matched: Vec<Event> = state
                .events
                .iter()
                .filter(|(_, held_by)| match held_by {
                    None => true,
                    Some(held_by) => relays.iter().any(|r| held_by.contains(r)),
                })
                .map(|(event, _)| event)
                .filter(|event| filter.matches(event))
                .cloned()
                .collect();

            matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
            if let Some(limit) = filter.limit {
                matched.truncate(limit);
            }
            Ok(matched)
        })
    }

    fn disconnect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.state.lock().disconnects.push(url.to_string());
        })
    }
}
