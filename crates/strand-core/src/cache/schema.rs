//! SQLite schema for the event cache.
//!
//! This module defines the database schema and rebuilds the cache database
//! when it was written under a different schema version.

use rusqlite::{Connection, Result};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
///
/// Creates all tables on a fresh database. The cache is disposable, so a
/// database written under any other version is dropped and rebuilt instead
/// of migrated.
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version != SCHEMA_VERSION {
        if current_version != 0 {
            drop_tables(conn)?;
        }
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    }

    Ok(())
}

/// Get the current schema version (0 if not initialized).
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

/// Create all tables for a fresh database.
fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Events keyed by id
        CREATE TABLE IF NOT EXISTS event_cache (
            event_id TEXT PRIMARY KEY,
            pubkey TEXT NOT NULL,
            kind INTEGER NOT NULL,
            event_json TEXT NOT NULL,
            relays TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            fetched_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        );

        -- Addressable events keyed by coordinate
        CREATE TABLE IF NOT EXISTS address_cache (
            kind INTEGER NOT NULL,
            pubkey TEXT NOT NULL,
            identifier TEXT NOT NULL,
            event_id TEXT NOT NULL,
            event_json TEXT NOT NULL,
            relays TEXT NOT NULL DEFAULT '[]',
            fetched_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            UNIQUE (kind, pubkey, identifier)
        );

        CREATE INDEX IF NOT EXISTS idx_event_cache_profile
            ON event_cache(pubkey, kind, fetched_at DESC, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_event_cache_expires ON event_cache(expires_at);
        CREATE INDEX IF NOT EXISTS idx_address_cache_expires ON address_cache(expires_at);
        "#,
    )?;

    Ok(())
}

fn drop_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        DROP TABLE IF EXISTS event_cache;
        DROP TABLE IF EXISTS address_cache;
        "#,
    )
}
