//! Identifier decoding.
//!
//! Turns raw user input (64-char hex or NIP-19 bech32, optionally behind a
//! `nostr:` scheme) into a [`Target`]. Decoding is pure: no lookups, no
//! guessing between event ids and pubkeys.

use nostr::nips::nip19::{FromBech32, Nip19};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::is_hex64;

const NOSTR_SCHEME: &str = "nostr:";

/// What an identifier points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Target {
    /// A single event (`note`, `nevent`, or raw hex).
    Event {
        id: String,
        relay_hints: Vec<String>,
    },
    /// A profile (`npub`, `nprofile`).
    Profile {
        pubkey: String,
        relay_hints: Vec<String>,
    },
    /// A parameterized replaceable event coordinate (`naddr`).
    Address {
        kind: u16,
        pubkey: String,
        identifier: String,
        relay_hints: Vec<String>,
    },
}

impl Target {
    /// Relay hints carried by the identifier, possibly empty.
    pub fn relay_hints(&self) -> &[String] {
        match self {
            Self::Event { relay_hints, .. }
            | Self::Profile { relay_hints, .. }
            | Self::Address { relay_hints, .. } => relay_hints,
        }
    }

    /// Short human-readable form used in log fields.
    pub fn describe(&self) -> String {
        match self {
            Self::Event { id, .. } => format!("event:{id}"),
            Self::Profile { pubkey, .. } => format!("profile:{pubkey}"),
            Self::Address {
                kind,
                pubkey,
                identifier,
                ..
            } => format!("address:{kind}:{pubkey}:{identifier}"),
        }
    }
}

/// Why an identifier could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("identifier is empty")]
    Empty,

    /// Secret keys are valid bech32 but are never resolvable.
    #[error("secret keys are not resolvable")]
    SecretKey,

    #[error("'{0}' is not a hex event id or a supported NIP-19 identifier")]
    Invalid(String),
}

/// Decode a raw identifier into a [`Target`].
///
/// Accepts:
/// - 64-character hex (any case) - treated as an event id
/// - `note1...`, `nevent1...` - events, the latter with relay hints
/// - `npub1...`, `nprofile1...` - profiles
/// - `naddr1...` - addressable event coordinates
///
/// Surrounding whitespace and a leading `nostr:` scheme are ignored.
pub fn decode(raw: &str) -> Result<Target, DecodeError> {
    let trimmed = strip_scheme(raw.trim()).trim();
    if trimmed.is_empty() {
        return Err(DecodeError::Empty);
    }

    if is_hex64(trimmed) {
        return Ok(Target::Event {
            id: trimmed.to_ascii_lowercase(),
            relay_hints: Vec::new(),
        });
    }

    decode_bech32(trimmed)
}

/// Decode a bare NIP-19 bech32 token (no scheme, no hex fallback).
pub fn decode_bech32(token: &str) -> Result<Target, DecodeError> {
    let lowered = token.to_ascii_lowercase();
    let nip19 =
        Nip19::from_bech32(&lowered).map_err(|_| DecodeError::Invalid(token.to_string()))?;

    match nip19 {
        Nip19::EventId(id) => Ok(Target::Event {
            id: id.to_hex(),
            relay_hints: Vec::new(),
        }),
        Nip19::Event(event) => Ok(Target::Event {
            id: event.event_id.to_hex(),
            relay_hints: event.relays.iter().map(|r| r.to_string()).collect(),
        }),
        Nip19::Pubkey(pk) => Ok(Target::Profile {
            pubkey: pk.to_hex(),
            relay_hints: Vec::new(),
        }),
        Nip19::Profile(profile) => Ok(Target::Profile {
            pubkey: profile.public_key.to_hex(),
            relay_hints: profile.relays.iter().map(|r| r.to_string()).collect(),
        }),
        Nip19::Coordinate(coord) => Ok(Target::Address {
            kind: coord.coordinate.kind.as_u16(),
            pubkey: coord.coordinate.public_key.to_hex(),
            identifier: coord.coordinate.identifier.clone(),
            relay_hints: coord.relays.iter().map(|r| r.to_string()).collect(),
        }),
        Nip19::Secret(_) => Err(DecodeError::SecretKey),
    }
}

fn strip_scheme(input: &str) -> &str {
    match input.get(..NOSTR_SCHEME.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(NOSTR_SCHEME) => &input[NOSTR_SCHEME.len()..],
        _ => input,
    }
}
