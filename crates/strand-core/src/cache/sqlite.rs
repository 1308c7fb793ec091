//! SQLite-backed [`CacheStore`].

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::schema;
use super::store::{AddressKey, AddressRow, CacheRow, CacheStore};
use crate::{Error, Result};

/// Persistent cache store.
///
/// One connection guarded by a mutex; every call is a short statement.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a cache database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(Error::Io)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn event_row(row: &Row<'_>) -> rusqlite::Result<CacheRow> {
    Ok(CacheRow {
        event_id: row.get(0)?,
        pubkey: row.get(1)?,
        kind: row.get(2)?,
        event_json: row.get(3)?,
        relays_json: row.get(4)?,
        created_at: row.get(5)?,
        fetched_at: row.get(6)?,
        expires_at: row.get(7)?,
    })
}

const EVENT_COLUMNS: &str =
    "event_id, pubkey, kind, event_json, relays, created_at, fetched_at, expires_at";

impl CacheStore for SqliteStore {
    fn find_by_event_id(&self, event_id: &str) -> Result<Option<CacheRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM event_cache WHERE event_id = ?1"),
                [event_id],
                event_row,
            )
            .optional()?;
        Ok(row)
    }

    fn find_latest_profile(&self, pubkey: &str) -> Result<Option<CacheRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM event_cache
                     WHERE pubkey = ?1 AND kind = 0
                     ORDER BY fetched_at DESC, created_at DESC, event_id ASC
                     LIMIT 1"
                ),
                [pubkey],
                event_row,
            )
            .optional()?;
        Ok(row)
    }

    fn find_by_address(&self, key: &AddressKey) -> Result<Option<AddressRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT event_id, event_json, relays, fetched_at, expires_at
                 FROM address_cache
                 WHERE kind = ?1 AND pubkey = ?2 AND identifier = ?3",
                params![key.kind, key.pubkey, key.identifier],
                |row| {
                    Ok(AddressRow {
                        key: key.clone(),
                        event_id: row.get(0)?,
                        event_json: row.get(1)?,
                        relays_json: row.get(2)?,
                        fetched_at: row.get(3)?,
                        expires_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn upsert_event(&self, row: &CacheRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO event_cache
                (event_id, pubkey, kind, event_json, relays, created_at, fetched_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(event_id) DO UPDATE SET
                pubkey = excluded.pubkey,
                kind = excluded.kind,
                event_json = excluded.event_json,
                relays = excluded.relays,
                created_at = excluded.created_at,
                fetched_at = excluded.fetched_at,
                expires_at = excluded.expires_at",
            params![
                row.event_id,
                row.pubkey,
                row.kind,
                row.event_json,
                row.relays_json,
                row.created_at,
                row.fetched_at,
                row.expires_at
            ],
        )?;
        Ok(())
    }

    fn upsert_address(&self, row: &AddressRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO address_cache
                (kind, pubkey, identifier, event_id, event_json, relays, fetched_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(kind, pubkey, identifier) DO UPDATE SET
                event_id = excluded.event_id,
                event_json = excluded.event_json,
                relays = excluded.relays,
                fetched_at = excluded.fetched_at,
                expires_at = excluded.expires_at",
            params![
                row.key.kind,
                row.key.pubkey,
                row.key.identifier,
                row.event_id,
                row.event_json,
                row.relays_json,
                row.fetched_at,
                row.expires_at
            ],
        )?;
        Ok(())
    }

    fn delete_event(&self, event_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM event_cache WHERE event_id = ?1", [event_id])?;
        Ok(())
    }

    fn delete_address(&self, key: &AddressKey) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM address_cache WHERE kind = ?1 AND pubkey = ?2 AND identifier = ?3",
            params![key.kind, key.pubkey, key.identifier],
        )?;
        Ok(())
    }

    fn delete_expired(&self, now: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let events = conn.execute("DELETE FROM event_cache WHERE expires_at <= ?1", [now])?;
        let addresses = conn.execute("DELETE FROM address_cache WHERE expires_at <= ?1", [now])?;
        Ok(events + addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(id: char, kind: u16, fetched_at: i64, expires_at: i64) -> CacheRow {
        CacheRow {
            event_id: id.to_string().repeat(64),
            pubkey: "p".repeat(64),
            kind,
            event_json: r#"{"id":"x"}"#.to_string(),
            relays_json: r#"["wss://a.example"]"#.to_string(),
            created_at: 0,
            fetched_at,
            expires_at,
        }
    }

    fn address(identifier: &str, event: char, expires_at: i64) -> AddressRow {
        AddressRow {
            key: AddressKey {
                kind: 30023,
                pubkey: "p".repeat(64),
                identifier: identifier.to_string(),
            },
            event_id: event.to_string().repeat(64),
            event_json: "{}".to_string(),
            relays_json: "[]".to_string(),
            fetched_at: 0,
            expires_at,
        }
    }

    #[test]
    fn test_event_roundtrip_and_upsert() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_event(&row('a', 1, 10, 20)).unwrap();

        let found = store.find_by_event_id(&"a".repeat(64)).unwrap().unwrap();
        assert_eq!(found, row('a', 1, 10, 20));

        store.upsert_event(&row('a', 1, 15, 99)).unwrap();
        let found = store.find_by_event_id(&"a".repeat(64)).unwrap().unwrap();
        assert_eq!(found.expires_at, 99);
    }

    #[test]
    fn test_missing_event_is_none() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.find_by_event_id("nope").unwrap().is_none());
    }

    #[test]
    fn test_latest_profile_ordering() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_event(&row('a', 0, 10, 100)).unwrap();
        store.upsert_event(&row('b', 0, 30, 100)).unwrap();
        store.upsert_event(&row('c', 1, 50, 100)).unwrap();

        let latest = store.find_latest_profile(&"p".repeat(64)).unwrap().unwrap();
        assert_eq!(latest.event_id, "b".repeat(64));
    }

    #[test]
    fn test_latest_profile_same_second_is_deterministic() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut older = row('a', 0, 30, 100);
        older.created_at = 100;
        let mut newer = row('c', 0, 30, 100);
        newer.created_at = 200;
        let twin = CacheRow {
            event_id: "b".repeat(64),
            ..newer.clone()
        };
        store.upsert_event(&older).unwrap();
        store.upsert_event(&newer).unwrap();
        store.upsert_event(&twin).unwrap();

        let latest = store.find_latest_profile(&"p".repeat(64)).unwrap().unwrap();
        assert_eq!(latest.event_id, "b".repeat(64));
    }

    #[test]
    fn test_address_upsert_replaces_event() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_address(&address("slug", 'a', 50)).unwrap();
        store.upsert_address(&address("slug", 'b', 60)).unwrap();

        let found = store
            .find_by_address(&address("slug", 'a', 0).key)
            .unwrap()
            .unwrap();
        assert_eq!(found.event_id, "b".repeat(64));
        assert_eq!(found.expires_at, 60);
    }

    #[test]
    fn test_delete_and_prune() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_event(&row('a', 1, 0, 10)).unwrap();
        store.upsert_event(&row('b', 1, 0, 30)).unwrap();
        store.upsert_address(&address("old", 'a', 5)).unwrap();
        store.upsert_address(&address("new", 'b', 30)).unwrap();

        assert_eq!(store.delete_expired(10).unwrap(), 2);
        assert!(store.find_by_event_id(&"a".repeat(64)).unwrap().is_none());
        assert!(store.find_by_event_id(&"b".repeat(64)).unwrap().is_some());

        store.delete_event(&"b".repeat(64)).unwrap();
        store.delete_address(&address("new", 'b', 0).key).unwrap();
        assert!(store.find_by_event_id(&"b".repeat(64)).unwrap().is_none());
        assert!(
            store
                .find_by_address(&address("new", 'b', 0).key)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cache.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.upsert_event(&row('a', 1, 10, 20)).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert!(store.find_by_event_id(&"a".repeat(64)).unwrap().is_some());
    }
}
