//! Relay selection.
//!
//! Builds the bounded, priority-ordered relay list used for one resolution:
//! a caller override beats identifier hints, which beat configured defaults.

use tracing::debug;

use super::url::{NormalizeOptions, NormalizeResult, normalize_relay_url_with_opts};

/// Candidate relay lists, in priority order.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelaySources<'a> {
    /// Caller-supplied relays for this request.
    pub override_relays: Option<&'a [String]>,
    /// Hints embedded in the decoded identifier.
    pub target_hints: Option<&'a [String]>,
    /// Configured default relays.
    pub defaults: Option<&'a [String]>,
}

/// Filtering and capping rules applied to every candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayPolicy {
    /// Maximum number of relays to return. `None` or `Some(0)` means no cap.
    pub max_relays: Option<usize>,
    /// When non-empty, only these relays may be selected (normalized form).
    pub allowlist: Vec<String>,
    /// Relays that are never selected (normalized form).
    pub denylist: Vec<String>,
    /// Accept plaintext `ws://` relays.
    pub allow_insecure: bool,
}

/// Select the relays to query.
///
/// Candidates are normalized and deduplicated in first-seen order, so the
/// highest-priority source wins when the cap is applied. An empty result means
/// there is nothing to query.
pub fn select_relays(sources: RelaySources<'_>, policy: &RelayPolicy) -> Vec<String> {
    let opts = NormalizeOptions {
        allow_insecure: policy.allow_insecure,
    };

    let candidates = [sources.override_relays, sources.target_hints, sources.defaults]
        .into_iter()
        .flatten()
        .flatten();

    let mut selected: Vec<String> = Vec::new();
    for candidate in candidates {
        let url = match normalize_relay_url_with_opts(candidate, opts) {
            NormalizeResult::Ok(url) => url,
            NormalizeResult::Invalid(reason) => {
                debug!(relay = %candidate, %reason, "Dropping invalid relay candidate");
                continue;
            }
            NormalizeResult::Insecure(url) => {
                debug!(relay = %url, "Dropping insecure relay candidate");
                continue;
            }
        };

        if !policy.allowlist.is_empty() && !policy.allowlist.contains(&url) {
            continue;
        }
        if policy.denylist.contains(&url) {
            continue;
        }
        if !selected.contains(&url) {
            selected.push(url);
        }
    }

    if let Some(max) = policy.max_relays
        && max > 0
    {
        selected.truncate(max);
    }

    selected
}
