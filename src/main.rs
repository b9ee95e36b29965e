use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

mod aggregator;
mod compare;
mod config;
mod dashboard;
mod feed;
mod identity;
mod model;
mod normalize;
mod teams;

use aggregator::Aggregator;
use config::Config;
use dashboard::AppState;
use feed::{FeedSet, SourceRegistry};
use normalize::Normalizer;
use teams::TeamAliases;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    // Alias table: built-in Premier League clubs, optionally extended from
    // a JSON file so promoted sides don't need a rebuild.
    let aliases = match &config.team_aliases {
        Some(path) => Arc::new(TeamAliases::premier_league_with_file(path)?),
        None => Arc::new(TeamAliases::premier_league()),
    };
    info!("Team alias table ready ({} clubs)", aliases.len());

    // The aggregation table plus its staleness sweep.
    let aggregator = Aggregator::new(Duration::from_secs(config.stale_after_secs));
    aggregator.spawn_sweeper(Duration::from_secs(config.sweep_interval_secs));

    // One feed task per configured producer.
    let feeds = config.feeds()?;
    let sources: Vec<_> = feeds.iter().map(|f| f.source).collect();
    info!("Configured {} producer feed(s): {:?}", feeds.len(), sources);
    let registry = SourceRegistry::new(&sources);
    let normalizer = Arc::new(Normalizer::new(aliases));
    let feed_set = FeedSet::spawn(feeds, normalizer, aggregator.clone(), registry.clone());

    // Dashboard HTTP server (blocks until shutdown).
    let state = AppState {
        aggregator,
        registry,
    };
    let app = dashboard::router(state);
    let addr: SocketAddr = config.dashboard_addr.parse()?;
    info!("Dashboard listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    // Unreachable in normal operation, but close feeds cleanly if the
    // server ever returns.
    feed_set.shutdown();
    feed_set.join().await;
    Ok(())
}
