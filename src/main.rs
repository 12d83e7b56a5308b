use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use linkpulse::app::Services;
use linkpulse::config::Config;
use linkpulse::storage::SqliteStore;

/// Page size used when rebuilding visitor counts at startup
const WARMUP_BATCH_SIZE: usize = 1000;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    info!("Loaded configuration");

    info!("Using SQLite storage: {}", config.database.url);
    let store = Arc::new(
        SqliteStore::new(&config.database.url, config.database.max_connections)
            .await
            .context("failed to open database")?,
    );
    store.init().await.context("failed to initialize schema")?;
    info!("Database initialized successfully");

    let services = Services::build(store, &config)?;
    if !config.cache.enabled {
        warn!("Result cache disabled, every request recomputes");
    }

    services
        .visitors
        .warm_from(services.store.as_ref(), WARMUP_BATCH_SIZE)
        .await
        .context("failed to warm visitor tracker")?;
    // Clicks are appended by the redirect service, so counts are refreshed
    // from the store rather than only at startup
    services.spawn_visitor_sync(std::time::Duration::from_secs(
        config.analytics.visitor_sync_secs,
    ));

    if config.scheduler.enabled {
        services.scheduler.clone().start();
    } else {
        info!("Batch scheduler disabled");
    }

    let router = services.router(config.scheduler.enabled);
    let addr = format!("{}:{}", config.api_server.host, config.api_server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("API server listening on http://{}", addr);

    axum::serve(listener, router).await?;
    Ok(())
}
