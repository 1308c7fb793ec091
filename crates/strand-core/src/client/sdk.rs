//! [`RelayClient`] backed by a nostr-sdk [`Client`].

use std::time::Duration;

use futures::future::BoxFuture;
use nostr::{EventId, Kind, PublicKey, Timestamp};
use nostr_sdk::{Client, Filter};
use tracing::{debug, warn};

use super::{RelayClient, RelayError};
use crate::event::{Event, EventFilter};

/// Connect timeout passed to nostr-sdk for a single relay.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Real relay access through nostr-sdk.
///
/// Events are signature-verified and schema-checked before they are handed
/// back; anything else is dropped with a debug log.
#[derive(Debug, Clone)]
pub struct SdkRelayClient {
    client: Client,
    connect_timeout: Duration,
}

impl SdkRelayClient {
    /// Create a client with no signer (read-only).
    pub fn new() -> Self {
        Self::with_client(Client::default())
    }

    /// Wrap an existing nostr-sdk client.
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Override the per-relay connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for SdkRelayClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayClient for SdkRelayClient {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<(), RelayError>> {
        Box::pin(async move {
            let connect_err = |reason: String| RelayError::Connect {
                url: url.to_string(),
                reason,
            };
            self.client
                .add_relay(url)
                .await
                .map_err(|e| connect_err(e.to_string()))?;
            self.client
                .try_connect_relay(url, self.connect_timeout)
                .await
                .map_err(|e| connect_err(e.to_string()))
        })
    }

    fn query<'a>(
        &'a self,
        relays: &'a [String],
        filter: &'a EventFilter,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<Event>, RelayError>> {
        Box::pin(async move {
            let sdk_filter = to_sdk_filter(filter)?;
            let events = self
                .client
                .fetch_events_from(relays.iter().map(String::as_str), sdk_filter, timeout)
                .await
                .map_err(|e| RelayError::Query(e.to_string()))?;

            Ok(events.into_iter().filter_map(convert_event).collect())
        })
    }

    fn disconnect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Err(e) = self.client.disconnect_relay(url).await {
                warn!(relay = %url, error = %e, "Failed to disconnect relay");
            }
        })
    }
}

/// Build a nostr-sdk filter. Malformed ids or pubkeys are rejected rather
/// than silently widening the query.
fn to_sdk_filter(filter: &EventFilter) -> Result<Filter, RelayError> {
    let mut out = Filter::new();

    if !filter.ids.is_empty() {
        out = out.ids(parse_event_ids(&filter.ids)?);
    }
    if !filter.authors.is_empty() {
        let authors = filter
            .authors
            .iter()
            .map(|pk| {
                PublicKey::from_hex(pk)
                    .map_err(|e| RelayError::InvalidFilter(format!("author {pk}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        out = out.authors(authors);
    }
    if !filter.kinds.is_empty() {
        out = out.kinds(filter.kinds.iter().copied().map(Kind::from));
    }
    if !filter.identifiers.is_empty() {
        out = out.identifiers(filter.identifiers.iter().cloned());
    }
    if !filter.references.is_empty() {
        out = out.events(parse_event_ids(&filter.references)?);
    }
    if let Some(since) = filter.since {
        out = out.since(Timestamp::from_secs(since));
    }
    if let Some(until) = filter.until {
        out = out.until(Timestamp::from_secs(until));
    }
    if let Some(limit) = filter.limit {
        out = out.limit(limit);
    }

    Ok(out)
}

fn parse_event_ids(ids: &[String]) -> Result<Vec<EventId>, RelayError> {
    ids.iter()
        .map(|id| {
            EventId::from_hex(id).map_err(|e| RelayError::InvalidFilter(format!("id {id}: {e}")))
        })
        .collect()
}

/// Verify and convert a relay event into the strict schema.
fn convert_event(event: nostr::Event) -> Option<Event> {
    if let Err(e) = event.verify() {
        debug!(id = %event.id, error = %e, "Dropping event with bad id or signature");
        return None;
    }

    let converted = Event {
        id: event.id.to_hex(),
        pubkey: event.pubkey.to_hex(),
        created_at: event.created_at.as_u64(),
        kind: event.kind.as_u16(),
        tags: event
            .tags
            .iter()
            .map(|tag| tag.as_slice().to_vec())
            .collect(),
        content: event.content.clone(),
        sig: event.sig.to_string(),
    };

    match converted.validate() {
        Ok(()) => Some(converted),
        Err(e) => {
            debug!(id = %converted.id, error = %e, "Dropping event failing schema validation");
            None
        }
    }
}
