//! TTL cache for resolved events.
//!
//! Three lookups share two keyspaces:
//! - event targets read the event row by id
//! - profile targets read the most recently fetched kind-0 row of the pubkey
//! - address targets read the address row by `(kind, pubkey, identifier)`
//!
//! Expired rows are deleted when read and by the prune sweep after each write.
//! The cache never fails a resolution: storage and decoding problems are
//! logged and treated as a miss.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::decode::Target;
use crate::event::Event;

pub mod schema;
pub mod sqlite;
pub mod store;

pub use sqlite::SqliteStore;
pub use store::{AddressKey, AddressRow, CacheRow, CacheStore, MemoryStore};

/// Which keyspace served a cache hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    Event,
    Address,
    Profile,
}

/// A decoded cache hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedEvent {
    pub event: Event,
    pub relays: Vec<String>,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub source: CacheSource,
}

/// Event/address cache over a pluggable [`CacheStore`].
#[derive(Clone)]
pub struct EventCache {
    store: Arc<dyn CacheStore>,
}

impl EventCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Cache backed by a fresh [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Look up a live entry for `target`.
    pub fn get(&self, target: &Target, now: DateTime<Utc>) -> Option<CachedEvent> {
        let now_secs = now.timestamp();

        match target {
            Target::Event { id, .. } => {
                let row = self.lookup(|| self.store.find_by_event_id(id))?;
                if row.expires_at <= now_secs {
                    self.expire(|| self.store.delete_event(&row.event_id));
                    return None;
                }
                decode_row(
                    &row.event_json,
                    &row.relays_json,
                    row.fetched_at,
                    row.expires_at,
                    CacheSource::Event,
                )
            }
            Target::Profile { pubkey, .. } => {
                let row = self.lookup(|| self.store.find_latest_profile(pubkey))?;
                if row.expires_at <= now_secs {
                    self.expire(|| self.store.delete_event(&row.event_id));
                    return None;
                }
                decode_row(
                    &row.event_json,
                    &row.relays_json,
                    row.fetched_at,
                    row.expires_at,
                    CacheSource::Profile,
                )
            }
            Target::Address {
                kind,
                pubkey,
                identifier,
                ..
            } => {
                let key = AddressKey {
                    kind: *kind,
                    pubkey: pubkey.clone(),
                    identifier: identifier.clone(),
                };
                let row = self.lookup(|| self.store.find_by_address(&key))?;
                if row.expires_at <= now_secs {
                    self.expire(|| self.store.delete_address(&key));
                    return None;
                }
                decode_row(
                    &row.event_json,
                    &row.relays_json,
                    row.fetched_at,
                    row.expires_at,
                    CacheSource::Address,
                )
            }
        }
    }

    /// Store `event` for `ttl_seconds`, then prune every expired row.
    ///
    /// The event row is always written; the address row only when `target`
    /// is an address. A non-positive TTL stores nothing.
    pub fn put(
        &self,
        event: &Event,
        relays: &[String],
        fetched_at: DateTime<Utc>,
        ttl_seconds: i64,
        target: Option<&Target>,
    ) {
        if ttl_seconds <= 0 {
            return;
        }

        let (event_json, relays_json) =
            match (serde_json::to_string(event), serde_json::to_string(relays)) {
                (Ok(e), Ok(r)) => (e, r),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(id = %event.id, error = %e, "Failed to serialize cache entry");
                    return;
                }
            };

        let fetched = fetched_at.timestamp();
        let expires = fetched.saturating_add(ttl_seconds);

        let row = CacheRow {
            event_id: event.id.clone(),
            pubkey: event.pubkey.clone(),
            kind: event.kind,
            event_json,
            relays_json,
            created_at: i64::try_from(event.created_at).unwrap_or(i64::MAX),
            fetched_at: fetched,
            expires_at: expires,
        };
        if let Err(e) = self.store.upsert_event(&row) {
            warn!(id = %event.id, error = %e, "Failed to write event cache row");
        }

        if let Some(Target::Address {
            kind,
            pubkey,
            identifier,
            ..
        }) = target
        {
            let address = AddressRow {
                key: AddressKey {
                    kind: *kind,
                    pubkey: pubkey.clone(),
                    identifier: identifier.clone(),
                },
                event_id: row.event_id.clone(),
                event_json: row.event_json.clone(),
                relays_json: row.relays_json.clone(),
                fetched_at: fetched,
                expires_at: expires,
            };
            if let Err(e) = self.store.upsert_address(&address) {
                warn!(id = %event.id, error = %e, "Failed to write address cache row");
            }
        }

        self.prune(fetched);
    }

    /// Delete every row expired at `now_secs`.
    fn prune(&self, now_secs: i64) {
        match self.store.delete_expired(now_secs) {
            Ok(0) => {}
            Ok(removed) => {
                metrics::counter!("nostr_event_cache_pruned_total").increment(removed as u64);
                debug!(removed, "Pruned expired cache rows");
            }
            Err(e) => warn!(error = %e, "Failed to prune expired cache rows"),
        }
    }

    fn lookup<T>(&self, find: impl FnOnce() -> crate::Result<Option<T>>) -> Option<T> {
        match find() {
            Ok(row) => row,
            Err(e) => {
                warn!(error = %e, "Cache lookup failed");
                None
            }
        }
    }

    fn expire(&self, delete: impl FnOnce() -> crate::Result<()>) {
        if let Err(e) = delete() {
            warn!(error = %e, "Failed to delete expired cache row");
        }
    }
}

fn decode_row(
    event_json: &str,
    relays_json: &str,
    fetched_at: i64,
    expires_at: i64,
    source: CacheSource,
) -> Option<CachedEvent> {
    let event: Event = match serde_json::from_str(event_json) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Corrupt cached event, treating as miss");
            return None;
        }
    };
    if let Err(e) = event.validate() {
        warn!(id = %event.id, error = %e, "Cached event failed validation, treating as miss");
        return None;
    }

    let relays = serde_json::from_str::<Vec<String>>(relays_json).unwrap_or_default();

    Some(CachedEvent {
        event,
        relays,
        fetched_at: DateTime::from_timestamp(fetched_at, 0).unwrap_or_default(),
        expires_at: DateTime::from_timestamp(expires_at, 0).unwrap_or_default(),
        source,
    })
}
