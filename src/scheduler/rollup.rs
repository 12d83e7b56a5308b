//! Rollup record computation for one link and one calendar period

use anyhow::Result;

use crate::analytics::plan::{Dimension, EventFilter, Projection, QueryPlan};
use crate::analytics::AggregationEngine;
use crate::error::AnalyticsResult;
use crate::models::{DateWindow, Granularity, RollupPeriod, RollupRecord};
use crate::storage::EventStore;

/// Links with at least one click inside `window`, sorted
pub async fn active_links(store: &dyn EventStore, window: DateWindow) -> Result<Vec<String>> {
    let rows = store
        .execute(&QueryPlan::distinct(EventFilter::all(Some(window)), Dimension::Link))
        .await?;
    Ok(rows.into_iter().map(|row| row.key).collect())
}

/// Build the rollup for `link_id` over `window`.
///
/// Unique visitors are an exact distinct count inside the window, so the same
/// inputs always produce the same record.
pub async fn compute_rollup(
    engine: &AggregationEngine,
    link_id: &str,
    period: RollupPeriod,
    window: DateWindow,
) -> AnalyticsResult<RollupRecord> {
    let filter = EventFilter::link(link_id, Some(window));
    let store = engine.store();
    let total = store.window_stats(&filter).await?.total;

    let distinct = QueryPlan::distinct(filter.clone(), Dimension::Link)
        .with_projection(Projection::UniqueVisitors);
    let unique_visitors = store
        .execute(&distinct)
        .await?
        .first()
        .map(|row| row.count)
        .unwrap_or(0);

    let (top_countries, top_devices, top_referrers) = tokio::try_join!(
        engine.breakdown(&filter, Dimension::Country, total),
        engine.breakdown(&filter, Dimension::DeviceType, total),
        engine.breakdown(&filter, Dimension::ReferrerDomain, total),
    )?;

    let breakdown = match period {
        RollupPeriod::Day => Vec::new(),
        RollupPeriod::Week => engine.timeline_points(&filter, Granularity::Day).await?,
        RollupPeriod::Month => engine.timeline_points(&filter, Granularity::Week).await?,
    };

    Ok(RollupRecord {
        link_id: link_id.to_string(),
        period,
        period_start: window.start,
        period_end: window.end,
        total_clicks: total,
        unique_visitors,
        top_countries,
        top_devices,
        top_referrers,
        breakdown,
    })
}
