//! Identifier resolution.
//!
//! [`Resolver::resolve`] turns a raw identifier into the target event, its
//! author's profile, its thread references and optionally a page of replies.
//! Steps run strictly in order:
//!
//! 1. guard the input and decode it
//! 2. validate the reply cursor
//! 3. select relays
//! 4. consult the cache
//! 5. on a miss, connect and fetch with a hard timeout
//! 6. find the author profile
//! 7. extract references
//! 8. write the cache
//! 9. fetch replies
//!
//! Each fetch is bounded by the timeout from the first connect to the last
//! answer. Connections opened for a resolution are leased for its duration
//! and released in the background once it finishes, successful or not.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::EventCache;
use crate::client::RelayClient;
use crate::config::ResolverConfig;
use crate::decode::{Target, decode};
use crate::error::ResolveError;
use crate::event::{Event, EventFilter, KIND_METADATA, ProfileMetadata};
use crate::relay::connection::ConnectionManager;
use crate::relay::select::{RelaySources, select_relays};
use crate::relay::session::RelaySession;
use crate::replies::{self, ReplyOptions, ReplyPage, validate_cursor};
use crate::threading::{ResolvedReferences, extract_references};

/// Longest raw identifier accepted.
pub const MAX_INPUT_LENGTH: usize = 512;

/// Per-call resolution options. Unset fields fall back to [`ResolverConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Relays that take priority over identifier hints and defaults.
    pub relays: Option<Vec<String>>,
    pub max_relays: Option<usize>,
    pub timeout: Option<Duration>,
    /// Cap applied to each reference category.
    pub reference_limit: Option<usize>,
    /// Fetch one page of replies of this size.
    pub reply_limit: Option<usize>,
    pub reply_cursor: Option<String>,
    pub reply_max_cycle_hops: Option<usize>,
}

/// Author of a resolved event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedAuthor {
    pub pubkey: String,
    /// Parsed kind-0 content, `None` when missing or unparsable.
    pub profile: Option<ProfileMetadata>,
    pub profile_event: Option<Event>,
}

/// A fully materialized identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedEvent {
    pub target: Target,
    pub event: Event,
    pub author: ResolvedAuthor,
    /// Relays the event is known to live on.
    pub relays: Vec<String>,
    pub references: ResolvedReferences,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replies: Option<ReplyPage>,
}

/// Resolves identifiers against relays through a shared connection manager
/// and cache.
pub struct Resolver<C: RelayClient> {
    manager: Arc<ConnectionManager<C>>,
    cache: EventCache,
    config: ResolverConfig,
}

impl<C: RelayClient> Resolver<C> {
    /// Create a resolver with its own connection manager.
    pub fn new(client: Arc<C>, cache: EventCache, config: ResolverConfig) -> Self {
        let manager = Arc::new(ConnectionManager::new(client, config.backoff));
        Self::with_manager(manager, cache, config)
    }

    /// Create a resolver sharing an existing connection manager.
    pub fn with_manager(
        manager: Arc<ConnectionManager<C>>,
        cache: EventCache,
        config: ResolverConfig,
    ) -> Self {
        Self {
            manager,
            cache,
            config,
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager<C>> {
        &self.manager
    }

    pub fn cache(&self) -> &EventCache {
        &self.cache
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve a raw identifier.
    pub async fn resolve(
        &self,
        raw: &str,
        options: &ResolveOptions,
    ) -> Result<ResolvedEvent, ResolveError> {
        let result = self.resolve_inner(raw, options).await;
        if let Err(e) = &result {
            counter!("nostr_event_resolve_failures_total", "reason" => e.kind()).increment(1);
            debug!(input = %raw, reason = e.kind(), "Resolution failed");
        }
        result
    }

    /// Fetch one page of replies to the event named by `raw`.
    ///
    /// `raw` may be hex, `note` or `nevent`; `nevent` hints join the relay
    /// selection after `relays`.
    pub async fn fetch_replies(
        &self,
        raw: &str,
        relays: Option<&[String]>,
        options: &ReplyOptions,
    ) -> Result<ReplyPage, ResolveError> {
        let target = decode_input(raw)?;
        let Target::Event { id, relay_hints } = &target else {
            return Err(ResolveError::UnsupportedId(format!(
                "{} does not name an event",
                target.describe()
            )));
        };
        validate_cursor(options.cursor.as_deref())?;

        let selected = self.select(relays, relay_hints, None);
        if selected.is_empty() {
            return Err(ResolveError::NoRelays);
        }

        replies::fetch_replies(&self.manager, id, &selected, options).await
    }

    async fn resolve_inner(
        &self,
        raw: &str,
        options: &ResolveOptions,
    ) -> Result<ResolvedEvent, ResolveError> {
        let target = decode_input(raw)?;
        validate_cursor(options.reply_cursor.as_deref())?;

        let relays = self.select(
            options.relays.as_deref(),
            target.relay_hints(),
            options.max_relays,
        );
        if relays.is_empty() {
            return Err(ResolveError::NoRelays);
        }

        let session = self.manager.session();
        self.materialize(&session, target, &relays, options).await
    }

    fn select(
        &self,
        override_relays: Option<&[String]>,
        hints: &[String],
        max_relays: Option<usize>,
    ) -> Vec<String> {
        let sources = RelaySources {
            override_relays,
            target_hints: Some(hints),
            defaults: Some(&self.config.default_relays),
        };
        select_relays(sources, &self.config.relay_policy(max_relays))
    }

    async fn materialize(
        &self,
        session: &RelaySession<C>,
        target: Target,
        relays: &[String],
        options: &ResolveOptions,
    ) -> Result<ResolvedEvent, ResolveError> {
        let timeout = options.timeout.unwrap_or(self.config.fetch_timeout);

        let cached = self.cache.get(&target, Utc::now());
        counter!(
            "nostr_event_cache_total",
            "result" => if cached.is_some() { "hit" } else { "miss" }
        )
        .increment(1);

        let (event, event_relays, author, from_network) = match cached {
            Some(hit) => {
                debug!(lookup = %target.describe(), source = ?hit.source, "Cache hit");
                let author = self.cached_author(&hit.event);
                let event_relays = if hit.relays.is_empty() {
                    relays.to_vec()
                } else {
                    hit.relays
                };
                (hit.event, event_relays, author, false)
            }
            None => {
                debug!(lookup = %target.describe(), "Cache miss");
                let event = self.fetch_target(session, &target, relays, timeout).await?;
                let author = self.fetch_author(session, &event, relays, timeout).await;
                (event, relays.to_vec(), author, true)
            }
        };

        let references = extract_references(&event, options.reference_limit);

        let ttl = self.config.cache_ttl_seconds;
        if from_network && ttl > 0 {
            let fetched_at = Utc::now();
            self.cache.put(&event, relays, fetched_at, ttl, Some(&target));
            if let Some(profile_event) = &author.profile_event
                && profile_event.id != event.id
            {
                self.cache.put(profile_event, relays, fetched_at, ttl, None);
            }
        }

        let replies = match options.reply_limit {
            Some(limit) => {
                let reply_options = ReplyOptions {
                    limit,
                    cursor: options.reply_cursor.clone(),
                    timeout,
                    max_cycle_hops: options
                        .reply_max_cycle_hops
                        .unwrap_or(self.config.reply_max_cycle_hops),
                };
                let page =
                    replies::fetch_replies(&self.manager, &event.id, relays, &reply_options)
                        .await?;
                Some(page)
            }
            None => None,
        };

        Ok(ResolvedEvent {
            target,
            event,
            author,
            relays: event_relays,
            references,
            replies,
        })
    }

    /// Fetch the target from the network, newest match first.
    async fn fetch_target(
        &self,
        session: &RelaySession<C>,
        target: &Target,
        relays: &[String],
        timeout: Duration,
    ) -> Result<Event, ResolveError> {
        let start = Instant::now();
        let fetched = session.fetch(relays, &target_filter(target), timeout).await;

        let found = newest(
            fetched
                .events
                .into_iter()
                .filter(|e| matches_target(target, e)),
        );
        if found.is_none() {
            if fetched.timed_out {
                warn!(
                    lookup = %target.describe(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Relay fetch timed out"
                );
            } else if fetched.answered == 0 {
                debug!(lookup = %target.describe(), "No relay answered");
            }
        }

        let outcome = if found.is_some() { "success" } else { "failure" };
        histogram!("nostr_event_relay_fetch_seconds", "outcome" => outcome)
            .record(start.elapsed().as_secs_f64());

        found.ok_or(ResolveError::NotFound)
    }

    /// Author from the cache only.
    fn cached_author(&self, event: &Event) -> ResolvedAuthor {
        if event.kind == KIND_METADATA {
            return author_of(event, Some(event.clone()));
        }
        let profile_target = Target::Profile {
            pubkey: event.pubkey.clone(),
            relay_hints: Vec::new(),
        };
        let profile_event = self
            .cache
            .get(&profile_target, Utc::now())
            .map(|hit| hit.event);
        author_of(event, profile_event)
    }

    /// Author from the cache, else one bounded kind-0 fetch. A missing
    /// profile is not an error.
    async fn fetch_author(
        &self,
        session: &RelaySession<C>,
        event: &Event,
        relays: &[String],
        timeout: Duration,
    ) -> ResolvedAuthor {
        let cached = self.cached_author(event);
        if cached.profile_event.is_some() {
            return cached;
        }

        let profile_target = Target::Profile {
            pubkey: event.pubkey.clone(),
            relay_hints: Vec::new(),
        };
        let fetched = session
            .fetch(relays, &target_filter(&profile_target), timeout)
            .await;
        if fetched.timed_out {
            debug!(pubkey = %event.pubkey, "Profile fetch timed out");
        }

        let profile_event = newest(
            fetched
                .events
                .into_iter()
                .filter(|e| matches_target(&profile_target, e)),
        );
        author_of(event, profile_event)
    }
}

fn decode_input(raw: &str) -> Result<Target, ResolveError> {
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return Err(ResolveError::UnsupportedId("identifier is empty".to_string()));
    }
    if cleaned.len() > MAX_INPUT_LENGTH {
        return Err(ResolveError::UnsupportedId(format!(
            "identifier longer than {MAX_INPUT_LENGTH} characters"
        )));
    }
    decode(cleaned).map_err(|e| ResolveError::UnsupportedId(e.to_string()))
}

fn author_of(event: &Event, profile_event: Option<Event>) -> ResolvedAuthor {
    ResolvedAuthor {
        pubkey: event.pubkey.clone(),
        profile: profile_event
            .as_ref()
            .and_then(|p| ProfileMetadata::from_content(&p.content)),
        profile_event,
    }
}

/// Relay filter for a target.
///
/// An empty `d` identifier is matched locally, so that filter carries no
/// limit: the newest event of the kind may belong to another identifier.
fn target_filter(target: &Target) -> EventFilter {
    match target {
        Target::Event { id, .. } => EventFilter::new().id(id.clone()).limit(1),
        Target::Profile { pubkey, .. } => EventFilter::new()
            .kind(KIND_METADATA)
            .author(pubkey.clone())
            .limit(1),
        Target::Address {
            kind,
            pubkey,
            identifier,
            ..
        } => {
            let filter = EventFilter::new().kind(*kind).author(pubkey.clone());
            if identifier.is_empty() {
                filter
            } else {
                filter.identifier(identifier.clone()).limit(1)
            }
        }
    }
}

fn matches_target(target: &Target, event: &Event) -> bool {
    match target {
        Target::Event { id, .. } => event.id == *id,
        Target::Profile { pubkey, .. } => event.kind == KIND_METADATA && event.pubkey == *pubkey,
        Target::Address {
            kind,
            pubkey,
            identifier,
            ..
        } => event.kind == *kind && event.pubkey == *pubkey && event.identifier() == identifier,
    }
}

/// Newest event; equal timestamps keep the lowest id.
fn newest(events: impl Iterator<Item = Event>) -> Option<Event> {
    events.max_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| b.id.cmp(&a.id))
    })
}
