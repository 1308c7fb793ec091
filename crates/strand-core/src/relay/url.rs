//! Relay URL normalization.
//!
//! Every relay candidate (caller override, identifier hint, configured
//! default, allow/deny list entry) goes through [`normalize_relay_url`] so
//! that deduplication and list membership compare like with like.
//!
//! # Normalization Rules
//!
//! - Trim whitespace
//! - Require a websocket scheme (wss:// or ws://)
//! - Parse with nostr's `RelayUrl` (lowercases scheme and host, drops the
//!   default port)
//! - Remove trailing slashes
//! - Reject plaintext `ws://` unless insecure relays are allowed

use nostr::RelayUrl;

/// Options for URL normalization.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeOptions {
    /// Accept plaintext `ws://` relays.
    pub allow_insecure: bool,
}

/// Result of URL normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeResult {
    /// URL is valid and normalized.
    Ok(String),
    /// URL is syntactically invalid.
    Invalid(String),
    /// URL is a plaintext `ws://` relay and insecure relays are not allowed.
    Insecure(String),
}

impl NormalizeResult {
    /// Returns the normalized URL if valid.
    pub fn ok(self) -> Option<String> {
        match self {
            Self::Ok(url) => Some(url),
            _ => None,
        }
    }

    /// Returns true if the URL is valid.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

/// Normalize a relay URL with default options (`wss://` only).
///
/// ```ignore
/// use strand_core::relay::url::normalize_relay_url;
///
/// assert_eq!(
///     normalize_relay_url("wss://Relay.Example.COM/").ok(),
///     Some("wss://relay.example.com".to_string())
/// );
/// ```
pub fn normalize_relay_url(url: &str) -> NormalizeResult {
    normalize_relay_url_with_opts(url, NormalizeOptions::default())
}

/// Normalize a relay URL with custom options.
pub fn normalize_relay_url_with_opts(url: &str, opts: NormalizeOptions) -> NormalizeResult {
    let url = url.trim();
    let lowered = url.to_ascii_lowercase();

    let insecure = lowered.starts_with("ws://");
    if !lowered.starts_with("wss://") && !insecure {
        return NormalizeResult::Invalid("URL must start with wss:// or ws://".to_string());
    }

    let parsed = match RelayUrl::parse(url) {
        Ok(u) => u,
        Err(e) => return NormalizeResult::Invalid(format!("Invalid relay URL: {}", e)),
    };

    let mut normalized = parsed.to_string();
    while normalized.ends_with('/') {
        normalized.pop();
    }

    if host(&normalized).is_empty() {
        return NormalizeResult::Invalid("empty host".to_string());
    }

    if insecure && !opts.allow_insecure {
        return NormalizeResult::Insecure(normalized);
    }

    NormalizeResult::Ok(normalized)
}

/// Normalize a list of relay URLs, silently dropping anything invalid.
///
/// Used for allow/deny lists, where membership only needs to compare
/// normalized forms. Insecure entries are kept so they can still be denied.
pub fn normalize_all<'a, I>(urls: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let opts = NormalizeOptions {
        allow_insecure: true,
    };
    urls.into_iter()
        .filter_map(|url| normalize_relay_url_with_opts(url, opts).ok())
        .collect()
}

fn host(url: &str) -> &str {
    let without_scheme = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .unwrap_or(url);
    without_scheme.split('/').next().unwrap_or(without_scheme)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_trailing_slash() {
        assert_eq!(
            normalize_relay_url("wss://relay.example.com/").ok(),
            Some("wss://relay.example.com".to_string())
        );
        assert_eq!(
            normalize_relay_url("wss://relay.example.com///").ok(),
            Some("wss://relay.example.com".to_string())
        );
    }

    #[test]
    fn test_normalize_lowercases_host() {
        assert_eq!(
            normalize_relay_url("  wss://Relay.Example.COM/ ").ok(),
            Some("wss://relay.example.com".to_string())
        );
    }

    #[test]
    fn test_normalize_preserves_path_and_port() {
        assert_eq!(
            normalize_relay_url("wss://relay.example.com/nostr").ok(),
            Some("wss://relay.example.com/nostr".to_string())
        );
        assert_eq!(
            normalize_relay_url("wss://relay.example.com:8080/").ok(),
            Some("wss://relay.example.com:8080".to_string())
        );
    }

    #[test]
    fn test_invalid_scheme() {
        assert!(matches!(
            normalize_relay_url("https://relay.example.com"),
            NormalizeResult::Invalid(_)
        ));
        assert!(matches!(
            normalize_relay_url("relay.example.com"),
            NormalizeResult::Invalid(_)
        ));
        assert!(matches!(normalize_relay_url(""), NormalizeResult::Invalid(_)));
    }

    #[test]
    fn test_insecure_rejected_by_default() {
        assert!(matches!(
            normalize_relay_url("ws://bad.example"),
            NormalizeResult::Insecure(_)
        ));
    }

    #[test]
    fn test_insecure_allowed_with_opts() {
        let opts = NormalizeOptions {
            allow_insecure: true,
        };
        assert_eq!(
            normalize_relay_url_with_opts("ws://relay.example.com/", opts).ok(),
            Some("ws://relay.example.com".to_string())
        );
    }

    #[test]
    fn test_valid_relays() {
        assert!(normalize_relay_url("wss://relay.damus.io").is_ok());
        assert!(normalize_relay_url("wss://nos.lol").is_ok());
        assert!(normalize_relay_url("wss://relay.snort.social").is_ok());
    }

    #[test]
    fn test_normalize_all_drops_invalid_keeps_insecure() {
        let list = normalize_all(["wss://a.example/", "nope", "ws://b.example"]);
        assert_eq!(list, vec!["wss://a.example", "ws://b.example"]);
    }
}
