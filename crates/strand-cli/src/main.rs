//! strand - resolve Nostr identifiers against live relays.
//!
//! Prints the resolved event, author profile, thread references and an
//! optional reply page as JSON on stdout. Logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Resolve a note with its first 20 replies
//! strand resolve nevent1... --reply-limit 20
//!
//! # Next page of replies
//! strand replies note1... --limit 20 --cursor 1710000000:<event id>
//!
//! # Query specific relays and dump metrics afterwards
//! strand --metrics resolve npub1... --relay wss://nos.lol
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use strand_core::metrics::try_init_metrics;
use strand_core::{ReplyOptions, ResolveOptions, Resolver, ResolverConfig, SdkRelayClient};

/// strand - Nostr identifier resolution.
#[derive(Parser, Debug)]
#[command(name = "strand")]
#[command(about = "Resolve Nostr identifiers against live relays", long_about = None)]
#[command(version)]
struct Args {
    /// Path to .env file (optional).
    #[arg(long, env = "DOTENV_PATH", default_value = ".env")]
    dotenv: String,

    /// Print Prometheus metrics to stderr when done.
    #[arg(long)]
    metrics: bool,

    /// Single-line JSON output.
    #[arg(long)]
    compact: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve an identifier (hex, note, nevent, npub, nprofile, naddr).
    Resolve {
        id: String,

        /// Relay to query first (repeatable).
        #[arg(long = "relay")]
        relays: Vec<String>,

        /// Cap on relays queried.
        #[arg(long)]
        max_relays: Option<usize>,

        /// Fetch timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Cap on each reference category.
        #[arg(long)]
        reference_limit: Option<usize>,

        /// Also fetch a page of this many replies.
        #[arg(long)]
        reply_limit: Option<usize>,

        /// Reply cursor from a previous page.
        #[arg(long, requires = "reply_limit")]
        reply_cursor: Option<String>,

        /// Reply-cycle walk depth (0 disables cycle detection).
        #[arg(long)]
        max_cycle_hops: Option<usize>,
    },

    /// Fetch one page of replies to an event (hex, note, nevent).
    Replies {
        id: String,

        /// Relay to query first (repeatable).
        #[arg(long = "relay")]
        relays: Vec<String>,

        /// Replies per page.
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Cursor from a previous page.
        #[arg(long)]
        cursor: Option<String>,

        /// Fetch timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Reply-cycle walk depth (0 disables cycle detection).
        #[arg(long)]
        max_cycle_hops: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if std::path::Path::new(&args.dotenv).exists() {
        dotenvy::from_path(&args.dotenv)?;
        eprintln!("Loaded environment from {}", args.dotenv);
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let metrics = if args.metrics {
        try_init_metrics()
    } else {
        None
    };

    let config = ResolverConfig::from_env().context("invalid resolver configuration")?;
    let cache = config.open_cache().context("failed to open event cache")?;
    let client = Arc::new(SdkRelayClient::new().connect_timeout(config.fetch_timeout));
    let resolver = Resolver::new(client, cache, config);

    tracing::debug!(command = ?args.command, "running command");
    let outcome = run(&resolver, args.command, args.compact).await;

    if let Some(handle) = metrics {
        eprintln!("{}", handle.render());
    }

    outcome
}

async fn run(resolver: &Resolver<SdkRelayClient>, command: Command, compact: bool) -> Result<()> {
    match command {
        Command::Resolve {
            id,
            relays,
            max_relays,
            timeout_ms,
            reference_limit,
            reply_limit,
            reply_cursor,
            max_cycle_hops,
        } => {
            let options = ResolveOptions {
                relays: (!relays.is_empty()).then_some(relays),
                max_relays,
                timeout: timeout_ms.map(Duration::from_millis),
                reference_limit,
                reply_limit,
                reply_cursor,
                reply_max_cycle_hops: max_cycle_hops,
            };
            let resolved = resolver
                .resolve(&id, &options)
                .await
                .map_err(|e| anyhow::anyhow!("{}: {e}", e.kind()))?;
            print_json(&resolved, compact)
        }
        Command::Replies {
            id,
            relays,
            limit,
            cursor,
            timeout_ms,
            max_cycle_hops,
        } => {
            let config = resolver.config();
            let options = ReplyOptions {
                limit,
                cursor,
                timeout: timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(config.fetch_timeout),
                max_cycle_hops: max_cycle_hops.unwrap_or(config.reply_max_cycle_hops),
            };
            let overrides = (!relays.is_empty()).then_some(relays.as_slice());
            let page = resolver
                .fetch_replies(&id, overrides, &options)
                .await
                .map_err(|e| anyhow::anyhow!("{}: {e}", e.kind()))?;
            print_json(&page, compact)
        }
    }
}

fn print_json<T: Serialize>(value: &T, compact: bool) -> Result<()> {
    let json = if compact {
        serde_json::to_string(value)?
    } else {
        serde_json::to_string_pretty(value)?
    };
    println!("{json}");
    Ok(())
}
