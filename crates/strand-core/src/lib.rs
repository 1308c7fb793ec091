//! Nostr identifier resolution.
//!
//! Turns a raw identifier (hex event id or NIP-19 bech32) into the event it
//! names, its author's profile, its thread references and a page of replies,
//! while tolerating an unreliable set of relays.
//!
//! # Architecture
//!
//! - **Decode**: hex / `note` / `nevent` / `npub` / `nprofile` / `naddr` into a [`Target`]
//! - **Relay**: URL normalization, priority selection, per-relay backoff and connect dedup
//! - **Cache**: TTL cache over memory or SQLite, keyed by event id and by address
//! - **Resolve**: the orchestrator tying the above together with a hard fetch timeout
//! - **Threading**: NIP-10 root/reply/mention extraction plus quotes, addresses, profiles
//! - **Replies**: cursor-paged replies with self-reference and cycle filtering
//!
//! Relay I/O goes through the [`RelayClient`] trait: [`SdkRelayClient`] talks to
//! real relays via nostr-sdk, [`MemoryRelayClient`] serves seeded events.

pub mod cache;
pub mod client;
pub mod config;
pub mod decode;
mod error;
pub mod event;
pub mod metrics;
pub mod relay;
pub mod replies;
pub mod resolve;
pub mod threading;

pub use cache::{CachedEvent, EventCache, MemoryStore, SqliteStore};
pub use client::{MemoryRelayClient, RelayClient, RelayError, SdkRelayClient};
pub use config::ResolverConfig;
pub use decode::{DecodeError, Target, decode};
pub use error::{Error, ResolveError, Result};
pub use event::{Event, EventFilter, ProfileMetadata};
pub use relay::{BackoffPolicy, ConnectionManager};
pub use replies::{ReplyCursor, ReplyOptions, ReplyPage};
pub use resolve::{ResolveOptions, ResolvedAuthor, ResolvedEvent, Resolver};
pub use threading::{ResolvedReferences, ThreadReferences, extract_references};
