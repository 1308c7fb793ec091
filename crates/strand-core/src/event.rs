//! Event schema, relay filters and profile metadata.
//!
//! [`Event`] is the strict shape every relay payload must have before it is
//! allowed into the resolver. Relay clients convert and validate at the
//! network boundary; anything that fails [`Event::validate`] is dropped there.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind number of profile metadata events.
pub const KIND_METADATA: u16 = 0;

/// Kind number of short text notes.
pub const KIND_TEXT_NOTE: u16 = 1;

/// A signed Nostr event (NIP-01).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event ID (64 lowercase hex).
    pub id: String,
    /// Author public key (64 lowercase hex).
    pub pubkey: String,
    /// Unix timestamp of event creation.
    pub created_at: u64,
    /// Event kind number.
    pub kind: u16,
    /// Event tags as nested arrays.
    pub tags: Vec<Vec<String>>,
    /// Event content (text, JSON, etc.).
    pub content: String,
    /// Schnorr signature (128 hex).
    pub sig: String,
}

/// Reason an event payload was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid field '{field}': {reason}")]
pub struct EventError {
    /// The name of the invalid field.
    pub field: &'static str,
    /// Description of what's wrong.
    pub reason: String,
}

impl Event {
    /// Check the structural invariants of the schema.
    ///
    /// Hex fields must be lowercase and of the right length. Cryptographic
    /// verification is the relay client's job.
    pub fn validate(&self) -> Result<(), EventError> {
        if !is_lower_hex(&self.id, 64) {
            return Err(EventError {
                field: "id",
                reason: "not 64 lowercase hex characters".to_string(),
            });
        }
        if !is_lower_hex(&self.pubkey, 64) {
            return Err(EventError {
                field: "pubkey",
                reason: "not 64 lowercase hex characters".to_string(),
            });
        }
        if !is_lower_hex(&self.sig, 128) {
            return Err(EventError {
                field: "sig",
                reason: "not 128 lowercase hex characters".to_string(),
            });
        }
        if self.tags.iter().any(|tag| tag.is_empty()) {
            return Err(EventError {
                field: "tags",
                reason: "empty tag".to_string(),
            });
        }
        Ok(())
    }

    /// First value of every tag named `name`, skipping empty values.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1))
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// The `d` tag identifier of an addressable event (empty if absent).
    pub fn identifier(&self) -> &str {
        self.tag_values("d").next().unwrap_or("")
    }
}

/// Whether `value` is exactly 64 hex characters (any case).
pub fn is_hex64(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// A one-shot relay query (NIP-01 filter subset).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventFilter {
    pub ids: Vec<String>,
    pub authors: Vec<String>,
    pub kinds: Vec<u16>,
    /// `#d` tag values.
    pub identifiers: Vec<String>,
    /// `#e` tag values.
    pub references: Vec<String>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.ids.push(id.into());
        self
    }

    pub fn author(mut self, pubkey: impl Into<String>) -> Self {
        self.authors.push(pubkey.into());
        self
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifiers.push(identifier.into());
        self
    }

    pub fn reference(mut self, event_id: impl Into<String>) -> Self {
        self.references.push(event_id.into());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event` satisfies every populated condition (`limit` aside).
    pub fn matches(&self, event: &Event) -> bool {
        if !self.ids.is_empty() && !self.ids.iter().any(|id| *id == event.id) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.iter().any(|pk| *pk == event.pubkey) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.identifiers.is_empty()
            && !event
                .tag_values("d")
                .any(|d| self.identifiers.iter().any(|want| want == d))
        {
            return false;
        }
        if !self.references.is_empty()
            && !event
                .tag_values("e")
                .any(|e| self.references.iter().any(|want| want == e))
        {
            return false;
        }
        if let Some(since) = self.since
            && event.created_at < since
        {
            return false;
        }
        if let Some(until) = self.until
            && event.created_at > until
        {
            return false;
        }
        true
    }
}

/// Parsed profile metadata from kind 0 JSON content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProfileMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// User-facing display name (takes priority over name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    /// NIP-05 identifier (e.g., "user@domain.com").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
    /// Lightning address for zaps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lud16: Option<String>,
}

impl ProfileMetadata {
    /// Parse from kind 0 JSON content. Anything that is not a JSON object
    /// yields `None`.
    pub fn from_content(content: &str) -> Option<Self> {
        if content.trim().is_empty() {
            return None;
        }
        serde_json::from_str(content).ok()
    }

    /// Get the best display name available, falling back through options.
    pub fn display_name(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or("Anonymous")
    }
}
