//! Prometheus metrics for identifier resolution.
//!
//! Library code records through the `metrics` facade only. Binaries that want
//! the numbers install the Prometheus recorder once at startup:
//!
//! ```rust,ignore
//! let handle = strand_core::metrics::init_metrics()?;
//! // ... resolve things ...
//! println!("{}", handle.render());
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: subsystem (`nostr_event_`, `relay_connect_`, `reply_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: small closed sets only (`result`, `outcome`, `reason`)

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and describe every metric.
///
/// Fails if a recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    Ok(handle)
}

/// Like [`init_metrics`] but returns `None` if a recorder is already
/// installed. Useful for tests or optional metrics.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    init_metrics().ok()
}

/// Register descriptions for every metric the crate records.
///
/// Called automatically by [`init_metrics`].
pub fn describe_metrics() {
    // =========================================================================
    // Resolution
    // =========================================================================

    describe_counter!(
        "nostr_event_cache_total",
        "Event cache lookups by result (hit, miss)"
    );
    describe_histogram!(
        "nostr_event_relay_fetch_seconds",
        "Time spent fetching the target event from relays, by outcome"
    );
    describe_counter!(
        "nostr_event_resolve_failures_total",
        "Failed resolutions by reason"
    );
    describe_counter!(
        "nostr_event_cache_pruned_total",
        "Expired cache rows removed by the prune sweep"
    );

    // =========================================================================
    // Relay Connections
    // =========================================================================

    describe_counter!(
        "relay_connect_attempts_total",
        "Physical relay connect attempts by outcome"
    );
    describe_counter!(
        "relay_connect_skipped_total",
        "Connect requests skipped because the relay was in backoff"
    );

    // =========================================================================
    // Replies
    // =========================================================================

    describe_counter!(
        "reply_cycles_dropped_total",
        "Replies dropped because their parent chain loops back to them"
    );
}
