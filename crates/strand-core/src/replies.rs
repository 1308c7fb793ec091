//! Reply fetching and pagination.
//!
//! A reply page is the set of kind-1 events whose thread references name the
//! target as root or reply, ordered newest first (ties broken by id
//! ascending). Pages continue from an opaque cursor, `"<created_at>:<id>"`,
//! naming the last item of the previous page.
//!
//! Two kinds of malformed threads are filtered out before paging:
//! - self-referential replies (an event naming itself as root or reply)
//! - reply cycles (events whose parent chain loops back to themselves within
//!   `max_cycle_hops` hops)

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use futures::future::join_all;
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::client::RelayClient;
use crate::error::ResolveError;
use crate::event::{Event, EventFilter, KIND_TEXT_NOTE};
use crate::relay::connection::ConnectionManager;
use crate::threading::{Marker, event_tags, normalize_event_id, thread_references};

/// Default depth of the reply-cycle walk.
pub const DEFAULT_MAX_CYCLE_HOPS: usize = 8;

/// One page of replies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplyPage {
    pub replies: Vec<Event>,
    /// At least `limit` matching items were available, so another page is
    /// plausible.
    pub has_more: bool,
    /// Cursor of the last item, present only when `has_more`.
    pub next_cursor: Option<String>,
}

/// Parameters of a reply fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyOptions {
    /// Maximum replies per page (values below 1 are treated as 1).
    pub limit: usize,
    pub cursor: Option<String>,
    pub timeout: Duration,
    /// Depth of the cycle walk; 0 disables cycle detection.
    pub max_cycle_hops: usize,
}

/// Why a cursor was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CursorError {
    #[error("expected '<created_at>:<event id>'")]
    Malformed,

    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("invalid event id '{0}'")]
    InvalidId(String),
}

/// Position of an item in newest-first order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyCursor {
    pub created_at: u64,
    pub id: String,
}

impl ReplyCursor {
    pub fn parse(raw: &str) -> Result<Self, CursorError> {
        let (ts, id) = raw.trim().split_once(':').ok_or(CursorError::Malformed)?;

        if ts.is_empty() || !ts.chars().all(|c| c.is_ascii_digit()) {
            return Err(CursorError::InvalidTimestamp(ts.to_string()));
        }
        let created_at = ts
            .parse()
            .map_err(|_| CursorError::InvalidTimestamp(ts.to_string()))?;
        let id = normalize_event_id(id).ok_or_else(|| CursorError::InvalidId(id.to_string()))?;

        Ok(Self { created_at, id })
    }

    /// Cursor pointing at `event`.
    pub fn of(event: &Event) -> Self {
        Self {
            created_at: event.created_at,
            id: event.id.clone(),
        }
    }

    /// Whether `event` sorts strictly after this position.
    fn precedes(&self, event: &Event) -> bool {
        match event.created_at.cmp(&self.created_at) {
            Ordering::Less => true,
            Ordering::Equal => event.id > self.id,
            Ordering::Greater => false,
        }
    }
}

impl fmt::Display for ReplyCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.created_at, self.id)
    }
}

/// Validate a raw cursor, mapping failures to the resolver's error kind.
pub fn validate_cursor(raw: Option<&str>) -> Result<Option<ReplyCursor>, ResolveError> {
    raw.map(ReplyCursor::parse)
        .transpose()
        .map_err(|e| ResolveError::InvalidReplyCursor(e.to_string()))
}

/// Fetch one page of replies to `event_id` from `relays`.
///
/// The cursor is checked before any network I/O. Connects and queries share
/// one timeout. Relay failures and timeouts shrink the page, never fail it.
pub async fn fetch_replies<C: RelayClient>(
    manager: &ConnectionManager<C>,
    event_id: &str,
    relays: &[String],
    options: &ReplyOptions,
) -> Result<ReplyPage, ResolveError> {
    let cursor = validate_cursor(options.cursor.as_deref())?;
    let target_id = event_id.trim().to_ascii_lowercase();
    let limit = options.limit.max(1);

    let session = manager.session();
    let filters = page_filters(&target_id, cursor.as_ref(), limit);
    let batches = join_all(
        filters
            .iter()
            .map(|filter| session.fetch(relays, filter, options.timeout)),
    )
    .await;

    if batches.iter().any(|batch| batch.timed_out) {
        warn!(
            event_id = %target_id,
            timeout_ms = options.timeout.as_millis() as u64,
            "Reply fetch timed out"
        );
    } else if batches.iter().all(|batch| batch.answered == 0) {
        debug!(event_id = %target_id, "No relay answered reply fetch");
    }
    let fetched: Vec<Event> = batches.into_iter().flat_map(|batch| batch.events).collect();

    Ok(paginate(
        &target_id,
        fetched,
        cursor.as_ref(),
        limit,
        options.max_cycle_hops,
    ))
}

/// Relay filters for one page.
///
/// With a cursor, the cursor's own second is fetched in full (ties are
/// resolved locally by id) and older events are fetched up to `limit`, so
/// already-delivered ties never crowd out unseen items.
fn page_filters(target_id: &str, cursor: Option<&ReplyCursor>, limit: usize) -> Vec<EventFilter> {
    let base = EventFilter::new().kind(KIND_TEXT_NOTE).reference(target_id);

    let Some(cursor) = cursor else {
        return vec![base.limit(limit)];
    };

    let mut filters = vec![base.clone().since(cursor.created_at).until(cursor.created_at)];
    if let Some(older) = cursor.created_at.checked_sub(1) {
        filters.push(base.until(older).limit(limit));
    }
    filters
}

/// Filter, order and page fetched replies.
pub(crate) fn paginate(
    target_id: &str,
    fetched: Vec<Event>,
    cursor: Option<&ReplyCursor>,
    limit: usize,
    max_cycle_hops: usize,
) -> ReplyPage {
    let mut seen = HashSet::new();
    let candidates: Vec<Event> = fetched
        .into_iter()
        .filter(|e| e.id != target_id && seen.insert(e.id.clone()))
        .filter(|e| references_target(e, target_id))
        .filter(|e| !is_self_referential(e))
        .collect();

    let mut replies = drop_reply_cycles(candidates, max_cycle_hops, target_id);
    replies.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

    let after: Vec<Event> = replies
        .into_iter()
        .filter(|e| cursor.is_none_or(|c| c.precedes(e)))
        .collect();

    let has_more = after.len() >= limit;
    let page: Vec<Event> = after.into_iter().take(limit).collect();
    let next_cursor = if has_more {
        page.last().map(|e| ReplyCursor::of(e).to_string())
    } else {
        None
    };

    ReplyPage {
        replies: page,
        has_more,
        next_cursor,
    }
}

fn references_target(event: &Event, target_id: &str) -> bool {
    let refs = thread_references(event, Some(&event.id));
    refs.root.iter().chain(&refs.reply).any(|id| id == target_id)
}

/// An event naming itself as root, reply, or in an unmarked position.
fn is_self_referential(event: &Event) -> bool {
    event_tags(event).any(|(id, marker)| id == event.id && marker != Marker::Mention)
}

/// First reply reference, else first root reference.
fn parent_of(event: &Event) -> Option<String> {
    let refs = thread_references(event, Some(&event.id));
    refs.reply.into_iter().next().or_else(|| refs.root.into_iter().next())
}

fn drop_reply_cycles(replies: Vec<Event>, max_hops: usize, thread_id: &str) -> Vec<Event> {
    if max_hops == 0 || replies.is_empty() {
        return replies;
    }

    let parents: HashMap<&str, String> = replies
        .iter()
        .filter_map(|e| parent_of(e).map(|parent| (e.id.as_str(), parent)))
        .collect();

    let cyclic: HashSet<String> = replies
        .iter()
        .filter(|e| reaches_self(&e.id, &parents, max_hops))
        .map(|e| e.id.clone())
        .collect();

    if cyclic.is_empty() {
        return replies;
    }

    counter!("reply_cycles_dropped_total").increment(cyclic.len() as u64);
    warn!(
        cycle_count = cyclic.len(),
        thread_id = %thread_id,
        "Detected and dropped reply cycles"
    );

    replies
        .into_iter()
        .filter(|e| !cyclic.contains(&e.id))
        .collect()
}

fn reaches_self(start: &str, parents: &HashMap<&str, String>, max_hops: usize) -> bool {
    let mut current = start;
    for _ in 0..max_hops {
        match parents.get(current) {
            Some(parent) if parent == start => return true,
            Some(parent) => current = parent.as_str(),
            None => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryRelayClient;
    use crate::relay::connection::BackoffPolicy;
    use std::sync::Arc;

    const RELAY: &str = "wss://relay.example";

    fn hex(s: &str) -> String {
        s.repeat(64 / s.len())
    }

    fn base_id() -> String {
        hex("a")
    }

    fn reply(id: &str, created_at: u64, extra: &[(&str, &str)]) -> Event {
        let mut tags = vec![vec![
            "e".to_string(),
            base_id(),
            String::new(),
            "root".to_string(),
        ]];
        for (target, marker) in extra {
            tags.push(vec![
                "e".to_string(),
                target.to_string(),
                String::new(),
                marker.to_string(),
            ]);
        }
        Event {
            id: id.to_string(),
            pubkey: hex("b"),
            created_at,
            kind: KIND_TEXT_NOTE,
            tags,
            content: "reply".to_string(),
            sig: hex("c").repeat(2),
        }
    }

    fn ids(page: &ReplyPage) -> Vec<String> {
        page.replies.iter().map(|e| e.id.clone()).collect()
    }

    fn options(limit: usize, cursor: Option<String>) -> ReplyOptions {
        ReplyOptions {
            limit,
            cursor,
            timeout: Duration::from_secs(2),
            max_cycle_hops: DEFAULT_MAX_CYCLE_HOPS,
        }
    }

    fn setup() -> (Arc<MemoryRelayClient>, ConnectionManager<MemoryRelayClient>) {
        let client = Arc::new(MemoryRelayClient::new());
        let manager = ConnectionManager::new(Arc::clone(&client), BackoffPolicy::default());
        (client, manager)
    }

    // =========================================================================
    // Cursor
    // =========================================================================

    #[test]
    fn test_cursor_roundtrip() {
        let raw = format!("1710000000:{}", hex("d"));
        let cursor = ReplyCursor::parse(&raw).unwrap();
        assert_eq!(cursor.created_at, 1_710_000_000);
        assert_eq!(cursor.to_string(), raw);
    }

    #[test]
    fn test_cursor_lowercases_id() {
        let cursor = ReplyCursor::parse(&format!("5:{}", hex("D"))).unwrap();
        assert_eq!(cursor.id, hex("d"));
    }

    #[test]
    fn test_cursor_rejects_malformed() {
        assert_eq!(
            ReplyCursor::parse("not-a-valid-cursor"),
            Err(CursorError::Malformed)
        );
        assert!(matches!(
            ReplyCursor::parse(&format!("-1:{}", hex("d"))),
            Err(CursorError::InvalidTimestamp(_))
        ));
        assert!(matches!(
            ReplyCursor::parse(&format!("99999999999999999999999:{}", hex("d"))),
            Err(CursorError::InvalidTimestamp(_))
        ));
        assert!(matches!(
            ReplyCursor::parse("10:abc"),
            Err(CursorError::InvalidId(_))
        ));
    }

    #[test]
    fn test_validate_cursor_maps_error_kind() {
        let err = validate_cursor(Some("garbage")).unwrap_err();
        assert_eq!(err.kind(), "invalid_reply_cursor");
        assert_eq!(validate_cursor(None), Ok(None));
    }

    // =========================================================================
    // Filtering
    // =========================================================================

    #[test]
    fn test_filters_self_referential_replies() {
        let loop_id = hex("c");
        let good_id = hex("d");
        let fetched = vec![
            reply(&loop_id, 1_710_000_001, &[(&loop_id, "reply")]),
            reply(&good_id, 1_710_000_002, &[]),
        ];

        let page = paginate(&base_id(), fetched, None, 10, DEFAULT_MAX_CYCLE_HOPS);
        assert_eq!(ids(&page), vec![good_id]);
    }

    #[test]
    fn test_drops_events_not_replying_to_target() {
        let mut quote_only = reply(&hex("c"), 10, &[]);
        quote_only.tags = vec![vec![
            "e".to_string(),
            base_id(),
            String::new(),
            "mention".to_string(),
        ]];
        let page = paginate(&base_id(), vec![quote_only], None, 10, 8);
        assert!(page.replies.is_empty());
    }

    #[test]
    fn test_filters_short_reply_cycles() {
        let (a, b, c) = (hex("e"), hex("f"), hex("1"));
        let fetched = vec![
            reply(&a, 1_710_000_001, &[(&b, "reply")]),
            reply(&b, 1_710_000_002, &[(&a, "reply")]),
            reply(&c, 1_710_000_003, &[]),
        ];
        let page = paginate(&base_id(), fetched, None, 10, DEFAULT_MAX_CYCLE_HOPS);
        assert_eq!(ids(&page), vec![c]);
    }

    #[test]
    fn test_filters_multi_hop_reply_cycles() {
        let (a, b, c, d) = (hex("2"), hex("3"), hex("4"), hex("5"));
        let fetched = vec![
            reply(&b, 1_710_000_012, &[(&c, "reply")]),
            reply(&d, 1_710_000_014, &[]),
            reply(&c, 1_710_000_013, &[(&a, "reply")]),
            reply(&a, 1_710_000_011, &[(&b, "reply")]),
        ];
        let page = paginate(&base_id(), fetched, None, 10, DEFAULT_MAX_CYCLE_HOPS);
        assert_eq!(ids(&page), vec![d]);
    }

    #[test]
    fn test_cycle_beyond_hop_limit_is_kept() {
        let (a, b, c) = (hex("11"), hex("12"), hex("13"));
        let fetched = vec![
            reply(&a, 1, &[(&b, "reply")]),
            reply(&b, 2, &[(&c, "reply")]),
            reply(&c, 3, &[(&a, "reply")]),
        ];
        let page = paginate(&base_id(), fetched, None, 10, 2);
        assert_eq!(page.replies.len(), 3);
    }

    #[test]
    fn test_zero_hops_disables_cycle_detection() {
        let (a, b) = (hex("21"), hex("22"));
        let fetched = vec![
            reply(&a, 1, &[(&b, "reply")]),
            reply(&b, 2, &[(&a, "reply")]),
        ];
        let page = paginate(&base_id(), fetched, None, 10, 0);
        assert_eq!(page.replies.len(), 2);
    }

    #[test]
    fn test_duplicates_across_relays_collapse() {
        let a = hex("2");
        let fetched = vec![reply(&a, 1, &[]), reply(&a, 1, &[])];
        let page = paginate(&base_id(), fetched, None, 10, 8);
        assert_eq!(page.replies.len(), 1);
    }

    // =========================================================================
    // Ordering and paging
    // =========================================================================

    #[test]
    fn test_newest_first_ties_by_id() {
        let fetched = vec![
            reply(&hex("3"), 10, &[]),
            reply(&hex("1"), 20, &[]),
            reply(&hex("2"), 20, &[]),
        ];
        let page = paginate(&base_id(), fetched, None, 10, 8);
        assert_eq!(ids(&page), vec![hex("1"), hex("2"), hex("3")]);
        assert!(!page.has_more);
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn test_has_more_sets_next_cursor() {
        let fetched = vec![
            reply(&hex("1"), 30, &[]),
            reply(&hex("2"), 20, &[]),
            reply(&hex("3"), 10, &[]),
        ];
        let page = paginate(&base_id(), fetched, None, 2, 8);
        assert_eq!(ids(&page), vec![hex("1"), hex("2")]);
        assert!(page.has_more);
        assert_eq!(page.next_cursor, Some(format!("20:{}", hex("2"))));
    }

    #[test]
    fn test_cursor_resumes_after_tie() {
        let fetched = vec![
            reply(&hex("1"), 20, &[]),
            reply(&hex("2"), 20, &[]),
            reply(&hex("3"), 10, &[]),
        ];
        let cursor = ReplyCursor {
            created_at: 20,
            id: hex("1"),
        };
        let page = paginate(&base_id(), fetched, Some(&cursor), 10, 8);
        assert_eq!(ids(&page), vec![hex("2"), hex("3")]);
    }

    #[test]
    fn test_page_filters_split_cursor_second() {
        let first = page_filters(&base_id(), None, 5);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].limit, Some(5));

        let cursor = ReplyCursor {
            created_at: 100,
            id: hex("1"),
        };
        let paged = page_filters(&base_id(), Some(&cursor), 5);
        assert_eq!(paged.len(), 2);
        assert_eq!((paged[0].since, paged[0].until, paged[0].limit), (Some(100), Some(100), None));
        assert_eq!((paged[1].until, paged[1].limit), (Some(99), Some(5)));
    }

    // =========================================================================
    // fetch_replies
    // =========================================================================

    #[tokio::test]
    async fn test_pagination_round_trip_no_gaps_or_duplicates() {
        let (client, manager) = setup();
        let expected: Vec<String> = (1..=5u64)
            .map(|n| {
                let id = hex(&n.to_string());
                client.add_event(reply(&id, 100 + (n % 3), &[]));
                id
            })
            .collect();

        let relays = vec![RELAY.to_string()];
        let mut collected = Vec::new();
        let mut cursor = None;
        for _ in 0..10 {
            let page = fetch_replies(&manager, &base_id(), &relays, &options(2, cursor.clone()))
                .await
                .unwrap();
            collected.extend(ids(&page));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let mut sorted = collected.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), collected.len());
        let mut want = expected.clone();
        want.sort();
        assert_eq!(sorted, want);
    }

    #[tokio::test]
    async fn test_invalid_cursor_does_no_io() {
        let (client, manager) = setup();
        let err = fetch_replies(
            &manager,
            &base_id(),
            &[RELAY.to_string()],
            &options(10, Some("not-a-valid-cursor".to_string())),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), "invalid_reply_cursor");
        assert_eq!(client.connect_attempts(RELAY), 0);
        assert_eq!(client.query_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_timeout_yields_empty_page() {
        let (client, manager) = setup();
        client.add_event(reply(&hex("1"), 10, &[]));
        client.set_query_delay(Duration::from_secs(30));

        let page = fetch_replies(&manager, &base_id(), &[RELAY.to_string()], &options(10, None))
            .await
            .unwrap();
        assert_eq!(page, ReplyPage::default());
    }

    #[tokio::test]
    async fn test_unreachable_relays_yield_empty_page() {
        let (client, manager) = setup();
        client.set_unreachable(RELAY, true);
        client.add_event(reply(&hex("1"), 10, &[]));

        let page = fetch_replies(&manager, &base_id(), &[RELAY.to_string()], &options(10, None))
            .await
            .unwrap();
        assert!(page.replies.is_empty());
        assert_eq!(client.query_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_connect_counts_against_timeout() {
        let (client, manager) = setup();
        client.set_connect_latency(RELAY, Duration::from_secs(30));
        client.add_event(reply(&hex("1"), 10, &[]));

        let started = tokio::time::Instant::now();
        let page = fetch_replies(&manager, &base_id(), &[RELAY.to_string()], &options(10, None))
            .await
            .unwrap();

        assert!(page.replies.is_empty());
        assert!(started.elapsed() <= Duration::from_secs(2));
    }
}
