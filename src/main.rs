//! wewrite-cache: read-through tiered cache server.
//!
//! Fronts the WeWrite API with per-domain caches (users, pages, ...):
//!   hot → warm → cold tiers by access frequency, each with its own TTL,
//!   single-flight fetching on miss, and invalidation broadcast on mutation.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use wewrite_cache::config::{Cli, Config};
use wewrite_cache::invalidation::persisted::{JsonFileStore, LocalStore, MemoryLocalStore};
use wewrite_cache::server::api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "wewrite_cache=debug,tower_http=debug"
    } else {
        "wewrite_cache=info,tower_http=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("wewrite-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    if let Some(upstream) = cli.upstream {
        config.upstream.base_url = upstream;
    }

    info!(
        upstream = %config.upstream.base_url,
        domains = config.domains.len(),
        "Configuration loaded"
    );

    for (name, domain) in &config.domains {
        info!(
            domain = %name,
            max_size = domain.cache.max_size,
            ttl_hot_ms = domain.cache.ttl_hot_ms,
            ttl_warm_ms = domain.cache.ttl_warm_ms,
            ttl_cold_ms = domain.cache.ttl_cold_ms,
            "Cache domain"
        );
    }

    // Persisted local copies.
    let local_store: Arc<dyn LocalStore> = match &config.invalidation.persisted_path {
        Some(path) => {
            info!(path = %path.display(), "Persisting local copies to disk");
            Arc::new(JsonFileStore::new(path))
        }
        None => Arc::new(MemoryLocalStore::new()),
    };

    // Build application state and start the expiry sweepers.
    let state = Arc::new(AppState::new(&config, local_store)?);
    let _sweepers: Vec<_> = state
        .domains
        .values()
        .filter_map(|served| served.cache.spawn_sweeper())
        .collect();

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    info!(addr = %listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
