//! Cache persistence seam.
//!
//! Rows are deliberately dumb: the event and its relay list are stored as
//! JSON text and only decoded by [`EventCache`](super::EventCache), so a
//! corrupt row never breaks a store.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::Result;

/// One cached event, keyed by event id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRow {
    pub event_id: String,
    pub pubkey: String,
    pub kind: u16,
    pub event_json: String,
    pub relays_json: String,
    /// The event's own timestamp, Unix seconds.
    pub created_at: i64,
    /// Unix seconds.
    pub fetched_at: i64,
    /// Unix seconds. The row is dead once `expires_at <= now`.
    pub expires_at: i64,
}

/// Addressable event coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddressKey {
    pub kind: u16,
    pub pubkey: String,
    pub identifier: String,
}

/// One cached addressable event, keyed by coordinate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRow {
    pub key: AddressKey,
    pub event_id: String,
    pub event_json: String,
    pub relays_json: String,
    pub fetched_at: i64,
    pub expires_at: i64,
}

/// Storage backend for [`EventCache`](super::EventCache).
///
/// Implementations serialize access internally and may be shared across
/// threads.
pub trait CacheStore: Send + Sync {
    fn find_by_event_id(&self, event_id: &str) -> Result<Option<CacheRow>>;

    /// Most recently fetched kind-0 row for `pubkey`. Rows fetched in the
    /// same second prefer the newer event, then the lowest event id.
    fn find_latest_profile(&self, pubkey: &str) -> Result<Option<CacheRow>>;

    fn find_by_address(&self, key: &AddressKey) -> Result<Option<AddressRow>>;

    /// Insert or replace the row with the same event id.
    fn upsert_event(&self, row: &CacheRow) -> Result<()>;

    /// Insert or replace the row with the same coordinate.
    fn upsert_address(&self, row: &AddressRow) -> Result<()>;

    fn delete_event(&self, event_id: &str) -> Result<()>;

    fn delete_address(&self, key: &AddressKey) -> Result<()>;

    /// Delete every row in both keyspaces with `expires_at <= now`.
    /// Returns the number of rows removed.
    fn delete_expired(&self, now: i64) -> Result<usize>;
}

/// Process-local store. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    events: Mutex<HashMap<String, CacheRow>>,
    addresses: Mutex<HashMap<AddressKey, AddressRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of rows across both keyspaces.
    pub fn len(&self) -> usize {
        self.events.lock().len() + self.addresses.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryStore {
    fn find_by_event_id(&self, event_id: &str) -> Result<Option<CacheRow>> {
        Ok(self.events.lock().get(event_id).cloned())
    }

    fn find_latest_profile(&self, pubkey: &str) -> Result<Option<CacheRow>> {
        Ok(self
            .events
            .lock()
            .values()
            .filter(|row| row.kind == 0 && row.pubkey == pubkey)
            .max_by(|a, b| {
                a.fetched_at
                    .cmp(&b.fetched_at)
                    .then(a.created_at.cmp(&b.created_at))
                    .then_with(|| b.event_id.cmp(&a.event_id))
            })
            .cloned())
    }

    fn find_by_address(&self, key: &AddressKey) -> Result<Option<AddressRow>> {
        Ok(self.addresses.lock().get(key).cloned())
    }

    fn upsert_event(&self, row: &CacheRow) -> Result<()> {
        self.events
            .lock()
            .insert(row.event_id.clone(), row.clone());
        Ok(())
    }

    fn upsert_address(&self, row: &AddressRow) -> Result<()> {
        self.addresses.lock().insert(row.key.clone(), row.clone());
        Ok(())
    }

    fn delete_event(&self, event_id: &str) -> Result<()> {
        self.events.lock().remove(event_id);
        Ok(())
    }

    fn delete_address(&self, key: &AddressKey) -> Result<()> {
        self.addresses.lock().remove(key);
        Ok(())
    }

    fn delete_expired(&self, now: i64) -> Result<usize> {
        let mut removed = 0;

        let mut events = self.events.lock();
        let before = events.len();
        events.retain(|_, row| row.expires_at > now);
        removed += before - events.len();
        drop(events);

        let mut addresses = self.addresses.lock();
        let before = addresses.len();
        addresses.retain(|_, row| row.expires_at > now);
        removed += before - addresses.len();

        Ok(removed)
    }
}
