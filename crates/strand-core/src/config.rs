//! Resolver configuration loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{EventCache, SqliteStore};
use crate::relay::connection::BackoffPolicy;
use crate::relay::select::RelayPolicy;
use crate::relay::url::normalize_all;
use crate::replies::DEFAULT_MAX_CYCLE_HOPS;
use crate::{Error, Result};

/// Relays used when neither the caller nor the identifier names any.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://relay.snort.social",
    "wss://nos.lol",
];

/// Default hard timeout for one relay fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_millis(8000);

/// Resolver configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Relays queried when no override or hint applies.
    pub default_relays: Vec<String>,

    /// Cap on the selected relay list (`None` = unlimited).
    pub max_relays: Option<usize>,

    /// Hard timeout for each relay fetch.
    pub fetch_timeout: Duration,

    /// TTL of cache writes. Zero disables them.
    pub cache_ttl_seconds: i64,

    /// SQLite cache location. `None` keeps the cache in memory.
    pub cache_path: Option<PathBuf>,

    /// Normalized relays allowed for selection (empty = all).
    pub relay_allowlist: Vec<String>,

    /// Normalized relays never selected.
    pub relay_denylist: Vec<String>,

    /// Accept `ws://` relays.
    pub allow_insecure: bool,

    /// Connect backoff for failing relays.
    pub backoff: BackoffPolicy,

    /// Depth of the reply-cycle walk.
    pub reply_max_cycle_hops: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            default_relays: DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect(),
            max_relays: None,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            cache_ttl_seconds: 0,
            cache_path: None,
            relay_allowlist: Vec::new(),
            relay_denylist: Vec::new(),
            allow_insecure: false,
            backoff: BackoffPolicy::default(),
            reply_max_cycle_hops: DEFAULT_MAX_CYCLE_HOPS,
        }
    }
}

impl ResolverConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional:
    /// - `NOSTR_RELAYS`: Comma-separated default relays (default: damus, snort, nos.lol)
    /// - `NOSTR_EVENT_MAX_RELAYS`: Cap on relays per resolution (default: unlimited)
    /// - `NOSTR_EVENT_FETCH_TIMEOUT_MS`: Fetch timeout (default: 8000)
    /// - `NOSTR_EVENT_CACHE_TTL_SECONDS`: Cache TTL, 0 disables writes (default: 0)
    /// - `NOSTR_EVENT_CACHE_PATH`: SQLite cache file (default: in-memory)
    /// - `NOSTR_RELAY_ALLOWLIST` / `NOSTR_RELAY_DENYLIST`: Comma-separated relays
    /// - `NOSTR_RELAY_ALLOW_INSECURE`: Accept `ws://` relays (default: false)
    /// - `NOSTR_RELAY_BACKOFF_BASE_MS`: First retry delay (default: 1000)
    /// - `NOSTR_RELAY_BACKOFF_MAX_MS`: Retry delay cap (default: 60000)
    /// - `NOSTR_REPLY_MAX_CYCLE_HOPS`: Reply-cycle walk depth (default: 8)
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let default_relays = match env_list("NOSTR_RELAYS") {
            Some(relays) if !relays.is_empty() => relays,
            _ => defaults.default_relays,
        };

        let max_relays = env_parse::<usize>("NOSTR_EVENT_MAX_RELAYS")?.filter(|&n| n > 0);

        let fetch_timeout = env_parse::<u64>("NOSTR_EVENT_FETCH_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.fetch_timeout);

        let cache_ttl_seconds = env_parse::<i64>("NOSTR_EVENT_CACHE_TTL_SECONDS")?
            .unwrap_or(defaults.cache_ttl_seconds);

        let cache_path = std::env::var("NOSTR_EVENT_CACHE_PATH")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let relay_allowlist = env_list("NOSTR_RELAY_ALLOWLIST")
            .map(|list| normalize_all(list.iter().map(String::as_str)))
            .unwrap_or_default();
        let relay_denylist = env_list("NOSTR_RELAY_DENYLIST")
            .map(|list| normalize_all(list.iter().map(String::as_str)))
            .unwrap_or_default();

        let allow_insecure = env_bool("NOSTR_RELAY_ALLOW_INSECURE")?.unwrap_or(false);

        let base = env_parse::<u64>("NOSTR_RELAY_BACKOFF_BASE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.backoff.base);
        let max = env_parse::<u64>("NOSTR_RELAY_BACKOFF_MAX_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.backoff.max);
        if max < base {
            return Err(Error::Config(format!(
                "NOSTR_RELAY_BACKOFF_MAX_MS ({}) is below NOSTR_RELAY_BACKOFF_BASE_MS ({})",
                max.as_millis(),
                base.as_millis()
            )));
        }

        let reply_max_cycle_hops = env_parse::<usize>("NOSTR_REPLY_MAX_CYCLE_HOPS")?
            .unwrap_or(defaults.reply_max_cycle_hops);

        tracing::info!(
            relays = ?default_relays,
            max_relays = ?max_relays,
            fetch_timeout_ms = fetch_timeout.as_millis() as u64,
            cache_ttl_seconds,
            cache_path = ?cache_path,
            allowlist_count = relay_allowlist.len(),
            denylist_count = relay_denylist.len(),
            allow_insecure,
            "resolver configuration loaded"
        );

        Ok(Self {
            default_relays,
            max_relays,
            fetch_timeout,
            cache_ttl_seconds,
            cache_path,
            relay_allowlist,
            relay_denylist,
            allow_insecure,
            backoff: BackoffPolicy { base, max },
            reply_max_cycle_hops,
        })
    }

    /// Selection policy, with an optional per-call cap replacing the
    /// configured one.
    pub fn relay_policy(&self, max_relays: Option<usize>) -> RelayPolicy {
        RelayPolicy {
            max_relays: max_relays.or(self.max_relays),
            allowlist: self.relay_allowlist.clone(),
            denylist: self.relay_denylist.clone(),
            allow_insecure: self.allow_insecure,
        }
    }

    /// Open the configured cache: SQLite when a path is set, memory otherwise.
    pub fn open_cache(&self) -> Result<EventCache> {
        match &self.cache_path {
            Some(path) => Ok(EventCache::new(Arc::new(SqliteStore::open(path)?))),
            None => Ok(EventCache::in_memory()),
        }
    }
}

/// Comma-separated list; `None` when the variable is unset.
fn env_list(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}"))),
        _ => Ok(None),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    let Ok(raw) = std::env::var(key) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(None),
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(Error::Config(format!("{key}={raw:?}: expected a boolean"))),
    }
}
