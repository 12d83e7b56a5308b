//! Wiring of stores, cache, engines and scheduler

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::alerts::AlertEngine;
use crate::analytics::aggregator::VISITOR_SYNC_BATCH;
use crate::analytics::{AggregationEngine, ClickRecorder, UniqueVisitorTracker, VisitorHasher};
use crate::api::{create_api_router, AppState};
use crate::cache::CacheLayer;
use crate::config::Config;
use crate::cursor::CursorSigner;
use crate::scheduler::BatchRollupScheduler;
use crate::storage::{EventSink, EventStore, LinkRepository, RollupStore};
use crate::trends::TrendEngine;

pub struct Services {
    pub store: Arc<dyn EventStore>,
    pub links: Arc<dyn LinkRepository>,
    pub rollups: Arc<dyn RollupStore>,
    pub visitors: Arc<UniqueVisitorTracker>,
    pub cache: Arc<CacheLayer>,
    pub engine: Arc<AggregationEngine>,
    pub trends: Arc<TrendEngine>,
    pub alerts: Arc<AlertEngine>,
    pub scheduler: Arc<BatchRollupScheduler>,
    pub cursors: Arc<CursorSigner>,
    /// Entry point for the redirect path; hashes IPs with the configured salt
    pub recorder: Arc<ClickRecorder>,
}

impl Services {
    /// Build everything on top of one backend implementing every storage trait
    pub fn build<S>(backend: Arc<S>, config: &Config) -> Result<Self>
    where
        S: EventStore + EventSink + LinkRepository + RollupStore + 'static,
    {
        let cache = Arc::new(CacheLayer::from_config(&config.cache));
        Self::with_cache(backend, config, cache)
    }

    pub fn with_cache<S>(backend: Arc<S>, config: &Config, cache: Arc<CacheLayer>) -> Result<Self>
    where
        S: EventStore + EventSink + LinkRepository + RollupStore + 'static,
    {
        let store: Arc<dyn EventStore> = backend.clone();
        let sink: Arc<dyn EventSink> = backend.clone();
        let links: Arc<dyn LinkRepository> = backend.clone();
        let rollups: Arc<dyn RollupStore> = backend;

        let visitors = Arc::new(UniqueVisitorTracker::new(
            config.analytics.exact_visitor_threshold,
        ));
        let engine = Arc::new(AggregationEngine::new(
            store.clone(),
            links.clone(),
            visitors.clone(),
            cache.clone(),
        ));
        let trends = Arc::new(TrendEngine::new(store.clone(), links.clone(), cache.clone()));
        let alerts = Arc::new(AlertEngine::new(store.clone(), links.clone(), cache.clone()));
        let scheduler = Arc::new(BatchRollupScheduler::new(
            engine.clone(),
            trends.clone(),
            rollups.clone(),
            config.scheduler.clone(),
            config.analytics.retention_days,
        ));
        let cursors = Arc::new(CursorSigner::new(
            config.pagination.cursor_hmac_secret.as_deref(),
        ));
        let recorder = Arc::new(ClickRecorder::new(
            sink,
            visitors.clone(),
            VisitorHasher::new(config.analytics.visitor_salt.as_deref())?,
        ));

        Ok(Self {
            store,
            links,
            rollups,
            visitors,
            cache,
            engine,
            trends,
            alerts,
            scheduler,
            cursors,
            recorder,
        })
    }

    /// Keep visitor counts current with events other writers append to the
    /// store, folding them in every `every`
    pub fn spawn_visitor_sync(&self, every: Duration) -> JoinHandle<()> {
        let visitors = self.visitors.clone();
        let store = self.store.clone();
        info!(every_secs = every.as_secs(), "Visitor sync started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = visitors.sync_from(store.as_ref(), VISITOR_SYNC_BATCH).await {
                    warn!(error = %e, "Visitor sync failed, retrying next tick");
                }
            }
        })
    }

    pub fn router(&self, expose_scheduler: bool) -> axum::Router {
        create_api_router(Arc::new(AppState {
            engine: self.engine.clone(),
            trends: self.trends.clone(),
            alerts: self.alerts.clone(),
            store: self.store.clone(),
            links: self.links.clone(),
            rollups: self.rollups.clone(),
            cursors: self.cursors.clone(),
            scheduler: expose_scheduler.then(|| self.scheduler.clone()),
        }))
    }
}
