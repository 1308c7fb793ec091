//! Relay connection manager.
//!
//! Tracks every relay URL the resolver has touched and decides whether a new
//! connect attempt is allowed:
//! - Per-relay exponential backoff after failures
//! - In-flight deduplication: concurrent callers share one attempt per URL
//! - Parallel attempts across URLs, so one slow relay never delays the rest
//! - Lease counting: every successful connect takes a lease, and a relay is
//!   disconnected in the background only when its last lease is released
//!
//! State transitions per URL:
//!
//! ```text
//! Unknown -> Connecting -> Connected
//!                      \-> Backoff -> Connecting (once now >= next_retry_at)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use metrics::counter;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::client::RelayClient;

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt after `failure_count` consecutive failures:
    /// `min(base * 2^(failure_count - 1), max)`.
    pub fn delay(&self, failure_count: u32) -> Duration {
        if failure_count == 0 {
            return Duration::ZERO;
        }
        let exponent = (failure_count - 1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }
}

/// Connection state of a single relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Unknown,
    Connecting,
    Connected,
    /// Last attempt failed; no new attempt before `next_retry_at`.
    Backoff,
}

/// Point-in-time view of a relay's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySnapshot {
    pub status: RelayStatus,
    pub failure_count: u32,
    pub next_retry_at: Option<Instant>,
    /// Callers currently holding the connection.
    pub leases: usize,
}

/// Result of [`ConnectionManager::connect`], partitioned by outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

type InFlight = Shared<BoxFuture<'static, bool>>;

struct RelayEntry {
    status: RelayStatus,
    failure_count: u32,
    next_retry_at: Option<Instant>,
    /// Set exactly while `status == Connecting`.
    in_flight: Option<InFlight>,
    leases: usize,
}

impl RelayEntry {
    fn new() -> Self {
        Self {
            status: RelayStatus::Unknown,
            failure_count: 0,
            next_retry_at: None,
            in_flight: None,
            leases: 0,
        }
    }

    fn snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            status: self.status,
            failure_count: self.failure_count,
            next_retry_at: self.next_retry_at,
            leases: self.leases,
        }
    }
}

struct Inner<C> {
    client: Arc<C>,
    backoff: BackoffPolicy,
    relays: Mutex<HashMap<String, RelayEntry>>,
}

/// Connection manager shared by every resolution that uses the same client.
///
/// Thread-safe: the per-URL table is behind a mutex that is never held
/// across an await.
pub struct ConnectionManager<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: RelayClient> ConnectionManager<C> {
    pub fn new(client: Arc<C>, backoff: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                backoff,
                relays: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The underlying relay client.
    pub fn client(&self) -> &Arc<C> {
        &self.inner.client
    }

    /// The backoff policy in effect.
    pub fn backoff(&self) -> BackoffPolicy {
        self.inner.backoff
    }

    /// Connect to every URL concurrently.
    ///
    /// URLs in backoff are reported failed without a network attempt. URLs
    /// already connected are reported succeeded without a new attempt.
    ///
    /// Each succeeded URL carries one lease; hand it back with [`release`].
    ///
    /// [`release`]: ConnectionManager::release
    pub async fn connect(&self, urls: &[String]) -> ConnectOutcome {
        let results = join_all(urls.iter().map(|url| self.connect_one(url))).await;

        let mut outcome = ConnectOutcome::default();
        for (url, ok) in urls.iter().zip(results) {
            if ok {
                outcome.succeeded.push(url.clone());
            } else {
                outcome.failed.push(url.clone());
            }
        }
        outcome
    }

    /// Connect to one URL, taking a lease on success.
    ///
    /// The lease is taken in the same poll that observes the connection, so a
    /// caller dropped at any await point never leaks one.
    pub(crate) async fn connect_one(&self, url: &str) -> bool {
        loop {
            let attempt = {
                let mut relays = self.inner.relays.lock();
                let entry = relays.entry(url.to_string()).or_insert_with(RelayEntry::new);

                if let Some(in_flight) = &entry.in_flight {
                    in_flight.clone()
                } else {
                    match entry.status {
                        RelayStatus::Connected => {
                            entry.leases += 1;
                            return true;
                        }
                        RelayStatus::Backoff
                            if entry
                                .next_retry_at
                                .is_some_and(|retry_at| Instant::now() < retry_at) =>
                        {
                            counter!("relay_connect_skipped_total").increment(1);
                            debug!(
                                relay = %url,
                                failure_count = entry.failure_count,
                                "Skipping relay in backoff"
                            );
                            return false;
                        }
                        _ => {
                            let attempt = Self::attempt(Arc::clone(&self.inner), url.to_string())
                                .boxed()
                                .shared();
                            entry.status = RelayStatus::Connecting;
                            entry.in_flight = Some(attempt.clone());
                            // Drive the attempt to completion even if every
                            // caller gives up, so its outcome is recorded.
                            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                                handle.spawn(attempt.clone());
                            }
                            attempt
                        }
                    }
                }
            };

            if !attempt.await {
                return false;
            }

            let leased = {
                let mut relays = self.inner.relays.lock();
                match relays.get_mut(url) {
                    Some(entry) if entry.status == RelayStatus::Connected => {
                        entry.leases += 1;
                        true
                    }
                    _ => false,
                }
            };
            if leased {
                return true;
            }
            // Released by every other holder before this caller resumed.
        }
    }

    /// One physical connect attempt. The outcome is recorded here, inside the
    /// shared future, so it is counted once no matter how many callers await.
    async fn attempt(inner: Arc<Inner<C>>, url: String) -> bool {
        let result = inner.client.connect(&url).await;

        let mut relays = inner.relays.lock();
        let entry = relays.entry(url.clone()).or_insert_with(RelayEntry::new);
        entry.in_flight = None;

        match result {
            Ok(()) => {
                counter!("relay_connect_attempts_total", "outcome" => "success").increment(1);
                entry.status = RelayStatus::Connected;
                entry.failure_count = 0;
                entry.next_retry_at = None;
                true
            }
            Err(e) => {
                counter!("relay_connect_attempts_total", "outcome" => "failure").increment(1);
                entry.failure_count = entry.failure_count.saturating_add(1);
                let delay = inner.backoff.delay(entry.failure_count);
                entry.status = RelayStatus::Backoff;
                entry.next_retry_at = Some(Instant::now() + delay);
                warn!(
                    relay = %url,
                    error = %e,
                    failure_count = entry.failure_count,
                    retry_in_ms = delay.as_millis() as u64,
                    "Relay connect failed"
                );
                false
            }
        }
    }

    /// Snapshot of a relay's state, if the manager has ever seen it.
    pub fn relay(&self, url: &str) -> Option<RelaySnapshot> {
        self.inner.relays.lock().get(url).map(RelayEntry::snapshot)
    }

    /// Hand back one lease per URL. Relays whose last lease is returned are
    /// marked idle and disconnected in the background.
    ///
    /// URLs without a lease are ignored. Failure history is kept. Returns
    /// immediately.
    pub fn release(&self, urls: &[String]) {
        let to_close: Vec<String> = {
            let mut relays = self.inner.relays.lock();
            urls.iter()
                .filter(|url| {
                    relays.get_mut(url.as_str()).is_some_and(|entry| {
                        if entry.leases == 0 {
                            return false;
                        }
                        entry.leases -= 1;
                        let idle = entry.leases == 0 && entry.status == RelayStatus::Connected;
                        if idle {
                            entry.status = RelayStatus::Unknown;
                        }
                        idle
                    })
                })
                .cloned()
                .collect()
        };

        if to_close.is_empty() {
            return;
        }

        let client = Arc::clone(&self.inner.client);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for url in &to_close {
                        client.disconnect(url).await;
                    }
                });
            }
            Err(_) => warn!(
                count = to_close.len(),
                "No async runtime available, relays left open"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryRelayClient;

    const GOOD: &str = "wss://good.example";
    const BAD: &str = "wss://bad.example";
    const SLOW: &str = "wss://slow.example";

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn manager(client: Arc<MemoryRelayClient>) -> ConnectionManager<MemoryRelayClient> {
        ConnectionManager::new(client, BackoffPolicy::default())
    }

    // =========================================================================
    // BackoffPolicy
    // =========================================================================

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(6), Duration::from_secs(32));
        assert_eq!(policy.delay(7), Duration::from_secs(60));
        assert_eq!(policy.delay(500), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_custom_policy() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(250),
            max: Duration::from_secs(1),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(250));
        assert_eq!(policy.delay(3), Duration::from_secs(1));
    }

    // =========================================================================
    // connect
    // =========================================================================

    #[tokio::test]
    async fn test_partitions_success_and_failure() {
        let client = Arc::new(MemoryRelayClient::new());
        client.set_unreachable(BAD, true);
        let manager = manager(client);

        let outcome = manager.connect(&urls(&[GOOD, BAD])).await;

        assert_eq!(outcome.succeeded, vec![GOOD]);
        assert_eq!(outcome.failed, vec![BAD]);
        assert_eq!(manager.relay(GOOD).unwrap().status, RelayStatus::Connected);
        let bad = manager.relay(BAD).unwrap();
        assert_eq!(bad.status, RelayStatus::Backoff);
        assert_eq!(bad.failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_in_parallel() {
        let client = Arc::new(MemoryRelayClient::new());
        client.set_connect_latency(SLOW, Duration::from_secs(5));
        client.set_connect_latency(GOOD, Duration::from_secs(5));
        let manager = manager(client);

        let start = Instant::now();
        let outcome = manager.connect(&urls(&[SLOW, GOOD])).await;

        assert_eq!(outcome.succeeded.len(), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_attempt() {
        let client = Arc::new(MemoryRelayClient::new());
        client.set_connect_latency(SLOW, Duration::from_secs(1));
        let manager = manager(Arc::clone(&client));

        let list = urls(&[SLOW]);
        let (a, b, c) = tokio::join!(
            manager.connect(&list),
            manager.connect(&list),
            manager.connect(&list)
        );

        assert_eq!(a.succeeded, vec![SLOW]);
        assert_eq!(b.succeeded, vec![SLOW]);
        assert_eq!(c.succeeded, vec![SLOW]);
        assert_eq!(client.connect_attempts(SLOW), 1);
        assert_eq!(manager.relay(SLOW).unwrap().leases, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_failure_counted_once() {
        let client = Arc::new(MemoryRelayClient::new());
        client.set_connect_latency(BAD, Duration::from_secs(1));
        client.set_unreachable(BAD, true);
        let manager = manager(Arc::clone(&client));

        let list = urls(&[BAD]);
        let (a, b) = tokio::join!(manager.connect(&list), manager.connect(&list));

        assert_eq!(a.failed, vec![BAD]);
        assert_eq!(b.failed, vec![BAD]);
        assert_eq!(client.connect_attempts(BAD), 1);
        assert_eq!(manager.relay(BAD).unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn test_connected_relay_not_reattempted() {
        let client = Arc::new(MemoryRelayClient::new());
        let manager = manager(Arc::clone(&client));

        manager.connect(&urls(&[GOOD])).await;
        let outcome = manager.connect(&urls(&[GOOD])).await;

        assert_eq!(outcome.succeeded, vec![GOOD]);
        assert_eq!(client.connect_attempts(GOOD), 1);
    }

    // =========================================================================
    // Backoff behavior
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_backoff_skips_then_retries() {
        let client = Arc::new(MemoryRelayClient::new());
        client.set_unreachable(BAD, true);
        let manager = manager(Arc::clone(&client));
        let list = urls(&[BAD]);

        manager.connect(&list).await;
        assert_eq!(client.connect_attempts(BAD), 1);

        // Inside the 1s window: no network attempt.
        tokio::time::advance(Duration::from_millis(500)).await;
        let outcome = manager.connect(&list).await;
        assert_eq!(outcome.failed, vec![BAD]);
        assert_eq!(client.connect_attempts(BAD), 1);

        // Window elapsed: retried, second failure doubles the delay.
        tokio::time::advance(Duration::from_millis(500)).await;
        manager.connect(&list).await;
        assert_eq!(client.connect_attempts(BAD), 2);
        let snapshot = manager.relay(BAD).unwrap();
        assert_eq!(snapshot.failure_count, 2);
        assert_eq!(
            snapshot.next_retry_at.unwrap() - Instant::now(),
            Duration::from_secs(2)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let client = Arc::new(MemoryRelayClient::new());
        client.set_unreachable(BAD, true);
        let manager = manager(Arc::clone(&client));
        let list = urls(&[BAD]);

        manager.connect(&list).await;
        client.set_unreachable(BAD, false);
        tokio::time::advance(Duration::from_secs(1)).await;

        let outcome = manager.connect(&list).await;
        assert_eq!(outcome.succeeded, vec![BAD]);
        let snapshot = manager.relay(BAD).unwrap();
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.next_retry_at, None);
        assert_eq!(snapshot.status, RelayStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_does_not_delay_other_relays() {
        let client = Arc::new(MemoryRelayClient::new());
        client.set_unreachable(BAD, true);
        client.set_connect_latency(BAD, Duration::from_secs(3));
        client.set_connect_latency(SLOW, Duration::from_secs(1));
        let manager = manager(Arc::clone(&client));

        let start = Instant::now();
        let outcome = manager.connect(&urls(&[GOOD, BAD, SLOW])).await;

        assert_eq!(outcome.succeeded, vec![GOOD, SLOW]);
        assert_eq!(outcome.failed, vec![BAD]);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(client.connect_attempts(GOOD), 1);
        assert_eq!(client.connect_attempts(SLOW), 1);
        assert_eq!(manager.relay(BAD).unwrap().status, RelayStatus::Backoff);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_attempt_still_recorded() {
        let client = Arc::new(MemoryRelayClient::new());
        client.set_unreachable(BAD, true);
        client.set_connect_latency(BAD, Duration::from_secs(5));
        let manager = manager(Arc::clone(&client));

        let gave_up = tokio::time::timeout(
            Duration::from_millis(100),
            manager.connect(&urls(&[BAD])),
        )
        .await;
        assert!(gave_up.is_err());
        assert_eq!(manager.relay(BAD).unwrap().status, RelayStatus::Connecting);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let snapshot = manager.relay(BAD).unwrap();
        assert_eq!(snapshot.status, RelayStatus::Backoff);
        assert_eq!(snapshot.failure_count, 1);
        assert_eq!(snapshot.leases, 0);
    }

    // =========================================================================
    // release
    // =========================================================================

    #[tokio::test]
    async fn test_release_disconnects_in_background() {
        let client = Arc::new(MemoryRelayClient::new());
        client.set_unreachable(BAD, true);
        let manager = manager(Arc::clone(&client));

        manager.connect(&urls(&[GOOD, BAD])).await;
        assert_eq!(manager.relay(GOOD).unwrap().leases, 1);
        assert_eq!(manager.relay(BAD).unwrap().leases, 0);
        manager.release(&urls(&[GOOD, BAD]));

        assert_eq!(manager.relay(GOOD).unwrap().status, RelayStatus::Unknown);
        assert_eq!(manager.relay(BAD).unwrap().status, RelayStatus::Backoff);

        for _ in 0..10 {
            if !client.disconnects().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(client.disconnects(), vec![GOOD]);
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_release_keeps_relay_open_for_other_holders() {
        let client = Arc::new(MemoryRelayClient::new());
        let manager = manager(Arc::clone(&client));
        let list = urls(&[GOOD]);

        let (a, b) = tokio::join!(manager.connect(&list), manager.connect(&list));
        assert_eq!(a.succeeded, vec![GOOD]);
        assert_eq!(b.succeeded, vec![GOOD]);

        manager.release(&list);
        settle().await;
        let snapshot = manager.relay(GOOD).unwrap();
        assert_eq!(snapshot.status, RelayStatus::Connected);
        assert_eq!(snapshot.leases, 1);
        assert!(client.disconnects().is_empty());

        manager.release(&list);
        settle().await;
        assert_eq!(manager.relay(GOOD).unwrap().status, RelayStatus::Unknown);
        assert_eq!(client.disconnects(), vec![GOOD]);
    }

    #[tokio::test]
    async fn test_release_without_lease_is_ignored() {
        let client = Arc::new(MemoryRelayClient::new());
        let manager = manager(Arc::clone(&client));
        let list = urls(&[GOOD]);

        manager.connect(&list).await;
        manager.release(&list);
        manager.release(&list);
        settle().await;

        assert_eq!(manager.relay(GOOD).unwrap().leases, 0);
        assert_eq!(client.disconnects(), vec![GOOD]);
    }

    #[tokio::test]
    async fn test_release_unknown_url_is_noop() {
        let client = Arc::new(MemoryRelayClient::new());
        let manager = manager(Arc::clone(&client));
        manager.release(&urls(&["wss://never.example"]));
        assert!(manager.relay("wss://never.example").is_none());
    }

    #[test]
    fn test_relay_unknown_returns_none() {
        let manager = manager(Arc::new(MemoryRelayClient::new()));
        assert!(manager.relay(GOOD).is_none());
    }
}
