//! Relay URL handling, selection and connection state.
//!
//! ```text
//! override / hints / defaults
//!            │
//!            ▼
//!   select_relays (normalize, allow/deny, dedup, cap)
//!            │
//!            ▼
//!   ConnectionManager::connect (parallel, deduplicated, backoff, leased)
//!            │
//!            ▼
//!   RelaySession::fetch (per-relay query, one deadline, leases dropped with it)
//! ```

pub mod connection;
pub mod select;
pub mod session;
pub mod url;

pub use connection::{
    BackoffPolicy, ConnectOutcome, ConnectionManager, RelaySnapshot, RelayStatus,
};
pub use select::{RelayPolicy, RelaySources, select_relays};
pub use session::{Fetched, RelaySession};
pub use url::{NormalizeOptions, NormalizeResult, normalize_relay_url};
