//! Thread reference extraction (NIP-10, NIP-18, NIP-27).
//!
//! Derives the reference graph of an event from its tags and inline
//! `nostr:` mentions:
//!
//! - `e` tags give root, reply and mention ids. Explicit markers win; when a
//!   marker is missing the positional convention applies (first unmarked id
//!   is the root, last unmarked id is the reply, the rest are mentions).
//! - `q` tags are quotes, `a` tags are addresses, `p` tags are profiles.
//! - `nostr:note1..`/`nevent1..` in content are mentions, `npub1..`/
//!   `nprofile1..` are profiles, `naddr1..` are addresses.
//!
//! Extraction is pure and never fails; malformed values are skipped.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::decode::{Target, decode_bech32};
use crate::event::{Event, is_hex64};

/// Inline `nostr:` URIs (NIP-27), matched case-insensitively.
static NOSTR_URI_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)nostr:([0-9a-z]+)").expect("Invalid nostr URI regex")
});

/// `e`-tag references of an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThreadReferences {
    pub root: Vec<String>,
    pub reply: Vec<String>,
    pub mention: Vec<String>,
}

/// Every reference category of an event, each deduplicated in first-seen
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolvedReferences {
    pub root: Vec<String>,
    pub reply: Vec<String>,
    pub mention: Vec<String>,
    pub quote: Vec<String>,
    /// `<kind>:<pubkey>:<identifier>` coordinates.
    pub address: Vec<String>,
    pub profiles: Vec<String>,
}

/// Explicit NIP-10 marker (4th element of an `e` tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Marker {
    Root,
    Reply,
    Mention,
    /// Absent or unrecognized.
    Unmarked,
}

impl Marker {
    pub(crate) fn of(tag: &[String]) -> Self {
        match tag.get(3).map(String::as_str) {
            Some("root") => Self::Root,
            Some("reply") => Self::Reply,
            Some("mention") => Self::Mention,
            _ => Self::Unmarked,
        }
    }
}

/// Lowercased event id, or `None` when it is not 64 hex characters.
pub(crate) fn normalize_event_id(raw: &str) -> Option<String> {
    let normalized = raw.trim().to_ascii_lowercase();
    is_hex64(&normalized).then_some(normalized)
}

/// Valid `e` tags of `event` as `(id, marker)` pairs, in tag order.
pub(crate) fn event_tags(event: &Event) -> impl Iterator<Item = (String, Marker)> + '_ {
    event
        .tags
        .iter()
        .filter(|tag| tag.first().map(String::as_str) == Some("e"))
        .filter_map(|tag| {
            let id = normalize_event_id(tag.get(1)?)?;
            Some((id, Marker::of(tag)))
        })
}

/// Root, reply and mention ids from the `e` tags of `event`.
///
/// References to `self_id` are skipped unless marked `root`.
pub fn thread_references(event: &Event, self_id: Option<&str>) -> ThreadReferences {
    let self_id = self_id.map(|id| id.trim().to_ascii_lowercase());

    let mut refs = ThreadReferences::default();
    let mut unmarked: Vec<String> = Vec::new();

    for (id, marker) in event_tags(event) {
        if self_id.as_deref() == Some(id.as_str()) && marker != Marker::Root {
            continue;
        }
        match marker {
            Marker::Root => refs.root.push(id),
            Marker::Reply => refs.reply.push(id),
            Marker::Mention => refs.mention.push(id),
            Marker::Unmarked => unmarked.push(id),
        }
    }

    if refs.root.is_empty()
        && let Some(first) = unmarked.first()
    {
        refs.root.push(first.clone());
    }
    if refs.reply.is_empty()
        && unmarked.len() > 1
        && let Some(last) = unmarked.last()
    {
        refs.reply.push(last.clone());
    }

    for id in unmarked {
        if !refs.root.contains(&id) && !refs.reply.contains(&id) {
            refs.mention.push(id);
        }
    }

    ThreadReferences {
        root: uniq(refs.root),
        reply: uniq(refs.reply),
        mention: uniq(refs.mention),
    }
}

/// All references of `event`, each category truncated to `limit`.
///
/// A `limit` of `None` or `Some(0)` keeps everything.
pub fn extract_references(event: &Event, limit: Option<usize>) -> ResolvedReferences {
    let thread = thread_references(event, Some(&event.id));

    let mut mention = thread.mention;
    let mut address: Vec<String> = event.tag_values("a").map(str::to_string).collect();
    let mut profiles: Vec<String> = event.tag_values("p").map(str::to_string).collect();
    let quote: Vec<String> = event.tag_values("q").map(str::to_string).collect();

    for target in inline_mentions(&event.content) {
        match target {
            Target::Event { id, .. } => mention.push(id),
            Target::Profile { pubkey, .. } => profiles.push(pubkey),
            Target::Address {
                kind,
                pubkey,
                identifier,
                ..
            } => address.push(format!("{kind}:{pubkey}:{identifier}")),
        }
    }

    let lower = |list: Vec<String>| -> Vec<String> {
        list.into_iter()
            .map(|v| v.trim().to_lowercase())
            .filter(|v| !v.is_empty())
            .collect()
    };

    ResolvedReferences {
        root: truncate(uniq(thread.root), limit),
        reply: truncate(uniq(thread.reply), limit),
        mention: truncate(
            uniq(mention.iter().filter_map(|id| normalize_event_id(id)).collect()),
            limit,
        ),
        quote: truncate(uniq(lower(quote)), limit),
        address: truncate(uniq(lower(address)), limit),
        profiles: truncate(uniq(lower(profiles)), limit),
    }
}

/// Decodable `nostr:` mentions in `content`, in order of appearance.
pub fn inline_mentions(content: &str) -> Vec<Target> {
    NOSTR_URI_REGEX
        .captures_iter(content)
        .filter_map(|caps| caps.get(1))
        .filter_map(|token| decode_bech32(token.as_str()).ok())
        .collect()
}

fn uniq(list: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(list.len());
    for item in list {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

fn truncate(mut list: Vec<String>, limit: Option<usize>) -> Vec<String> {
    if let Some(limit) = limit
        && limit > 0
    {
        list.truncate(limit);
    }
    list
}
