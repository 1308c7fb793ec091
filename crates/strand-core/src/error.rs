//! Error types for Nostr identifier resolution.
//!
//! Two layers:
//! - [`ResolveError`]: the closed set of terminal outcomes a caller of
//!   [`Resolver`](crate::Resolver) can observe. Callers match on it to pick a
//!   user-facing message.
//! - [`Error`]: infrastructure failures (SQLite, JSON, configuration) that stay
//!   inside the crate or surface during setup.

use thiserror::Error;

/// Result type alias using the crate's infrastructure error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Infrastructure errors (storage, serialization, configuration).
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite error from the cache store.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON encoding/decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error (bad environment value, etc.).
    #[error("configuration error: {0}")]
    Config(String),
}

/// Terminal outcome of a resolution or reply-page request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The input is neither 64-char hex nor a supported NIP-19 identifier.
    #[error("unsupported identifier: {0}")]
    UnsupportedId(String),

    /// Relay selection produced an empty set.
    #[error("no relays available to resolve this identifier")]
    NoRelays,

    /// No relay returned the target within the timeout.
    #[error("event not found on any selected relay")]
    NotFound,

    /// The reply pagination cursor failed validation.
    #[error("invalid reply cursor: {0}")]
    InvalidReplyCursor(String),
}

impl ResolveError {
    /// Stable snake_case name of the error kind, used for metrics labels and
    /// by outer layers when mapping to status codes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedId(_) => "unsupported_id",
            Self::NoRelays => "no_relays",
            Self::NotFound => "not_found",
            Self::InvalidReplyCursor(_) => "invalid_reply_cursor",
        }
    }

    /// Whether retrying (with other relays or a longer timeout) can succeed
    /// without the caller changing its input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}
