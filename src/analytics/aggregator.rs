//! Read-optimized views over click events
//!
//! Every public view checks ownership first, then goes through the cache
//! layer. The `compute_*` helpers bypass the cache and are shared with the
//! batch rollup jobs.

use chrono::{DateTime, Duration, Timelike, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

use crate::analytics::authorize;
use crate::analytics::plan::{Dimension, EventFilter, GroupCount, QueryPlan};
use crate::analytics::views::{
    CompareEntry, CompareView, CustomReportQuery, CustomReportView, DeviceView,
    DimensionBreakdown, GeographicView, PerformanceView, ReferrerView, SummaryView, TimelineView,
    UserOverview,
};
use crate::analytics::visitors::UniqueVisitorTracker;
use crate::cache::{fingerprint, CacheKey, CacheLayer, ViewKind};
use crate::error::{AnalyticsError, AnalyticsResult};
use crate::models::{
    percentage, round2, BreakdownItem, DateWindow, Granularity, TimelinePoint,
};
use crate::storage::{EventStore, LinkRepository};

pub const MAX_COMPARE_LINKS: usize = 10;
pub const MAX_REPORT_LINKS: usize = 20;
pub const TOP_LINKS: usize = 10;
/// Events read per page when catching the visitor tracker up with the store
pub const VISITOR_SYNC_BATCH: usize = 1000;

pub struct AggregationEngine {
    store: Arc<dyn EventStore>,
    links: Arc<dyn LinkRepository>,
    visitors: Arc<UniqueVisitorTracker>,
    cache: Arc<CacheLayer>,
}

impl AggregationEngine {
    pub fn new(
        store: Arc<dyn EventStore>,
        links: Arc<dyn LinkRepository>,
        visitors: Arc<UniqueVisitorTracker>,
        cache: Arc<CacheLayer>,
    ) -> Self {
        Self {
            store,
            links,
            visitors,
            cache,
        }
    }

    pub fn visitors(&self) -> &Arc<UniqueVisitorTracker> {
        &self.visitors
    }

    /// Catch the tracker up with events appended since the last sync. A failed
    /// sync leaves counts as they were.
    async fn sync_visitors(&self) {
        if let Err(e) = self
            .visitors
            .sync_from(self.store.as_ref(), VISITOR_SYNC_BATCH)
            .await
        {
            warn!(error = %e, "Visitor tracker sync failed, serving last known counts");
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub async fn summary(
        &self,
        caller: &str,
        link_id: &str,
        window: Option<DateWindow>,
    ) -> AnalyticsResult<SummaryView> {
        authorize(self.links.as_ref(), caller, link_id).await?;
        let view = ViewKind::Summary;
        let key = CacheKey::new(view, link_id, &window);
        self.cache
            .get_or_compute(&key, view.ttl(), || self.compute_summary(link_id, window))
            .await
    }

    pub async fn geographic(
        &self,
        caller: &str,
        link_id: &str,
        window: Option<DateWindow>,
    ) -> AnalyticsResult<GeographicView> {
        authorize(self.links.as_ref(), caller, link_id).await?;
        let view = ViewKind::Geographic;
        let key = CacheKey::new(view, link_id, &window);
        self.cache
            .get_or_compute(&key, view.ttl(), || self.compute_geographic(link_id, window))
            .await
    }

    pub async fn device(
        &self,
        caller: &str,
        link_id: &str,
        window: Option<DateWindow>,
    ) -> AnalyticsResult<DeviceView> {
        authorize(self.links.as_ref(), caller, link_id).await?;
        let view = ViewKind::Device;
        let key = CacheKey::new(view, link_id, &window);
        self.cache
            .get_or_compute(&key, view.ttl(), || self.compute_device(link_id, window))
            .await
    }

    pub async fn referrer(
        &self,
        caller: &str,
        link_id: &str,
        window: Option<DateWindow>,
    ) -> AnalyticsResult<ReferrerView> {
        authorize(self.links.as_ref(), caller, link_id).await?;
        let view = ViewKind::Referrer;
        let key = CacheKey::new(view, link_id, &window);
        self.cache
            .get_or_compute(&key, view.ttl(), || self.compute_referrer(link_id, window))
            .await
    }

    pub async fn timeline(
        &self,
        caller: &str,
        link_id: &str,
        window: Option<DateWindow>,
        granularity: Granularity,
    ) -> AnalyticsResult<TimelineView> {
        let window = match window {
            Some(window) => {
                granularity.check_window(&window)?;
                window
            }
            None => granularity.default_window(Utc::now()),
        };
        let window = Some(window);
        authorize(self.links.as_ref(), caller, link_id).await?;
        let view = ViewKind::Timeline(granularity);
        let key = CacheKey::new(view, link_id, &(window, granularity));
        self.cache
            .get_or_compute(&key, view.ttl(), || async {
                let points = self
                    .timeline_points(&EventFilter::link(link_id, window), granularity)
                    .await?;
                Ok(TimelineView {
                    link_id: link_id.to_string(),
                    window,
                    granularity,
                    total_clicks: points.iter().map(|p| p.clicks).sum(),
                    points,
                })
            })
            .await
    }

    pub async fn compare(
        &self,
        caller: &str,
        link_ids: &[String],
        window: Option<DateWindow>,
    ) -> AnalyticsResult<CompareView> {
        check_link_count(link_ids, MAX_COMPARE_LINKS)?;
        for link_id in link_ids {
            authorize(self.links.as_ref(), caller, link_id).await?;
        }

        let view = ViewKind::Compare;
        let key = CacheKey::new(view, &link_ids.join(","), &window);
        self.cache
            .get_or_compute(&key, view.ttl(), || async {
                self.sync_visitors().await;
                let mut totals = Vec::with_capacity(link_ids.len());
                for link_id in link_ids {
                    let stats = self
                        .store
                        .window_stats(&EventFilter::link(link_id, window))
                        .await?;
                    totals.push((link_id.clone(), stats.total));
                }
                let combined: u64 = totals.iter().map(|(_, total)| total).sum();
                let links = totals
                    .into_iter()
                    .map(|(link_id, total)| CompareEntry {
                        unique_visitors: self.visitors.count(&link_id),
                        share: percentage(total, combined),
                        total_clicks: total,
                        link_id,
                    })
                    .collect();
                Ok(CompareView {
                    window,
                    total_clicks: combined,
                    links,
                })
            })
            .await
    }

    pub async fn custom_report(
        &self,
        caller: &str,
        query: CustomReportQuery,
    ) -> AnalyticsResult<CustomReportView> {
        check_link_count(&query.link_ids, MAX_REPORT_LINKS)?;
        if query.dimensions.is_empty() {
            return Err(AnalyticsError::validation(
                "at least one dimension is required",
            ));
        }
        for link_id in &query.link_ids {
            authorize(self.links.as_ref(), caller, link_id).await?;
        }

        let view = ViewKind::CustomReport;
        let key = CacheKey::new(view, &fingerprint(&query.link_ids), &query);
        self.cache
            .get_or_compute(&key, view.ttl(), || async {
                let filter = EventFilter::links(&query.link_ids, query.window);
                let total = self.store.window_stats(&filter).await?.total;
                let links = self
                    .breakdown_with_limit(&filter, Dimension::Link, None, total)
                    .await?;

                let mut breakdowns = Vec::with_capacity(query.dimensions.len());
                for dimension in &query.dimensions {
                    breakdowns.push(DimensionBreakdown {
                        dimension: *dimension,
                        items: self.breakdown(&filter, *dimension, total).await?,
                    });
                }

                Ok(CustomReportView {
                    window: query.window,
                    total_clicks: total,
                    links,
                    breakdowns,
                })
            })
            .await
    }

    /// Aggregate across every link the caller owns
    pub async fn user_overview(
        &self,
        caller: &str,
        window: Option<DateWindow>,
    ) -> AnalyticsResult<UserOverview> {
        let view = ViewKind::UserAggregate;
        let key = CacheKey::new(view, caller, &window);
        self.cache
            .get_or_compute(&key, view.ttl(), || async {
                let link_ids = self.links.links_for_owner(caller).await?;
                let filter = EventFilter::links(&link_ids, window);
                let total = self.store.window_stats(&filter).await?.total;
                let (top_links, top_countries) = tokio::try_join!(
                    self.breakdown_with_limit(&filter, Dimension::Link, Some(TOP_LINKS), total),
                    self.breakdown(&filter, Dimension::Country, total),
                )?;

                Ok(UserOverview {
                    user_id: caller.to_string(),
                    window,
                    total_links: link_ids.len(),
                    total_clicks: total,
                    top_links,
                    top_countries,
                })
            })
            .await
    }

    pub async fn performance(&self, caller: &str, link_id: &str) -> AnalyticsResult<PerformanceView> {
        authorize(self.links.as_ref(), caller, link_id).await?;
        let view = ViewKind::Performance;
        let key = CacheKey::new(view, link_id, &());
        self.cache
            .get_or_compute(&key, view.ttl(), || {
                self.compute_performance(link_id, Utc::now())
            })
            .await
    }

    pub async fn compute_summary(
        &self,
        link_id: &str,
        window: Option<DateWindow>,
    ) -> AnalyticsResult<SummaryView> {
        self.sync_visitors().await;
        let filter = EventFilter::link(link_id, window);
        let stats = self.store.window_stats(&filter).await?;
        let total = stats.total;
        let (top_countries, top_devices, top_browsers, top_referrers) = tokio::try_join!(
            self.breakdown(&filter, Dimension::Country, total),
            self.breakdown(&filter, Dimension::DeviceType, total),
            self.breakdown(&filter, Dimension::Browser, total),
            self.breakdown(&filter, Dimension::ReferrerDomain, total),
        )?;

        Ok(SummaryView {
            link_id: link_id.to_string(),
            window,
            total_clicks: total,
            unique_visitors: self.visitors.count(link_id),
            first_click: stats.first_click,
            last_click: stats.last_click,
            top_countries,
            top_devices,
            top_browsers,
            top_referrers,
        })
    }

    pub async fn compute_geographic(
        &self,
        link_id: &str,
        window: Option<DateWindow>,
    ) -> AnalyticsResult<GeographicView> {
        let filter = EventFilter::link(link_id, window);
        let total = self.store.window_stats(&filter).await?.total;
        let (countries, regions, cities) = tokio::try_join!(
            self.breakdown(&filter, Dimension::Country, total),
            self.breakdown(&filter, Dimension::Region, total),
            self.breakdown(&filter, Dimension::City, total),
        )?;

        Ok(GeographicView {
            link_id: link_id.to_string(),
            window,
            total_clicks: total,
            countries,
            regions,
            cities,
        })
    }

    pub async fn compute_device(
        &self,
        link_id: &str,
        window: Option<DateWindow>,
    ) -> AnalyticsResult<DeviceView> {
        let filter = EventFilter::link(link_id, window);
        let total = self.store.window_stats(&filter).await?.total;
        let (device_types, brands, operating_systems, browsers) = tokio::try_join!(
            self.breakdown(&filter, Dimension::DeviceType, total),
            self.breakdown(&filter, Dimension::DeviceBrand, total),
            self.breakdown(&filter, Dimension::Os, total),
            self.breakdown(&filter, Dimension::Browser, total),
        )?;

        Ok(DeviceView {
            link_id: link_id.to_string(),
            window,
            total_clicks: total,
            device_types,
            brands,
            operating_systems,
            browsers,
        })
    }

    pub async fn compute_referrer(
        &self,
        link_id: &str,
        window: Option<DateWindow>,
    ) -> AnalyticsResult<ReferrerView> {
        let filter = EventFilter::link(link_id, window);
        let total = self.store.window_stats(&filter).await?.total;
        let (domains, types, utm_sources, utm_mediums, utm_campaigns) = tokio::try_join!(
            self.breakdown(&filter, Dimension::ReferrerDomain, total),
            self.breakdown(&filter, Dimension::ReferrerType, total),
            self.breakdown(&filter, Dimension::UtmSource, total),
            self.breakdown(&filter, Dimension::UtmMedium, total),
            self.breakdown(&filter, Dimension::UtmCampaign, total),
        )?;

        Ok(ReferrerView {
            link_id: link_id.to_string(),
            window,
            total_clicks: total,
            domains,
            types,
            utm_sources,
            utm_mediums,
            utm_campaigns,
        })
    }

    pub async fn compute_performance(
        &self,
        link_id: &str,
        now: DateTime<Utc>,
    ) -> AnalyticsResult<PerformanceView> {
        let count = |days: i64| {
            let filter = EventFilter::link(link_id, Some(DateWindow::trailing(now, Duration::days(days))));
            async move { self.store.window_stats(&filter).await.map(|s| s.total) }
        };
        let (last_24h, last_7d, last_30d) = tokio::try_join!(count(1), count(7), count(30))?;

        let month = EventFilter::link(link_id, Some(DateWindow::trailing(now, Duration::days(30))));
        let hourly = self.store.execute(&QueryPlan::hourly(month)).await?;
        let mut by_hour = [0u64; 24];
        for row in &hourly {
            if let Some(ts) = parse_hour_key(&row.key) {
                by_hour[ts.hour() as usize] += row.count;
            }
        }
        // Earliest hour wins a tie
        let peak = by_hour
            .iter()
            .enumerate()
            .filter(|(_, clicks)| **clicks > 0)
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(&a.0)));

        Ok(PerformanceView {
            link_id: link_id.to_string(),
            clicks_last_24h: last_24h,
            clicks_last_7d: last_7d,
            clicks_last_30d: last_30d,
            average_daily_clicks: round2(last_30d as f64 / 30.0),
            peak_hour: peak.map(|(hour, _)| hour as u32),
            peak_hour_clicks: peak.map(|(_, clicks)| *clicks).unwrap_or(0),
        })
    }

    /// Top-N breakdown with percentages relative to `total`
    pub async fn breakdown(
        &self,
        filter: &EventFilter,
        dimension: Dimension,
        total: u64,
    ) -> AnalyticsResult<Vec<BreakdownItem>> {
        self.breakdown_with_limit(filter, dimension, dimension.top_n(), total)
            .await
    }

    async fn breakdown_with_limit(
        &self,
        filter: &EventFilter,
        dimension: Dimension,
        limit: Option<usize>,
        total: u64,
    ) -> AnalyticsResult<Vec<BreakdownItem>> {
        let plan = QueryPlan::breakdown(filter.clone(), dimension).with_limit(limit);
        let rows = self.store.execute(&plan).await?;
        Ok(to_items(rows, total))
    }

    /// Chronological click counts folded from hourly groups
    pub async fn timeline_points(
        &self,
        filter: &EventFilter,
        granularity: Granularity,
    ) -> AnalyticsResult<Vec<TimelinePoint>> {
        let rows = self.store.execute(&QueryPlan::hourly(filter.clone())).await?;
        Ok(fold_hours(&rows, granularity))
    }

    /// Owners of links clicked inside `window`
    pub async fn active_owners(&self, window: DateWindow) -> AnalyticsResult<Vec<String>> {
        let rows = self
            .store
            .execute(&QueryPlan::distinct(EventFilter::all(Some(window)), Dimension::Link))
            .await?;
        let mut owners = HashSet::new();
        for row in rows {
            if let Some(owner) = self.links.lookup_owner(&row.key).await? {
                owners.insert(owner);
            }
        }
        let mut owners: Vec<String> = owners.into_iter().collect();
        owners.sort();
        Ok(owners)
    }
}

fn check_link_count(link_ids: &[String], max: usize) -> AnalyticsResult<()> {
    if link_ids.is_empty() {
        return Err(AnalyticsError::validation("at least one link id is required"));
    }
    if link_ids.len() > max {
        return Err(AnalyticsError::validation(format!(
            "at most {max} link ids are allowed, got {}",
            link_ids.len()
        )));
    }
    Ok(())
}

fn to_items(rows: Vec<GroupCount>, total: u64) -> Vec<BreakdownItem> {
    rows.into_iter()
        .map(|row| BreakdownItem {
            percentage: percentage(row.count, total),
            count: row.count,
            value: row.key,
        })
        .collect()
}

fn parse_hour_key(key: &str) -> Option<DateTime<Utc>> {
    key.parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// Hour rows arrive sorted, and bucket keys are monotonic in time,
/// so equal buckets are always adjacent.
pub fn fold_hours(rows: &[GroupCount], granularity: Granularity) -> Vec<TimelinePoint> {
    let mut hours: Vec<(DateTime<Utc>, u64)> = rows
        .iter()
        .filter_map(|row| parse_hour_key(&row.key).map(|ts| (ts, row.count)))
        .collect();
    hours.sort_by_key(|(ts, _)| *ts);

    let mut points: Vec<TimelinePoint> = Vec::new();
    for (ts, clicks) in hours {
        let bucket = granularity.bucket_key(ts);
        match points.last_mut() {
            Some(last) if last.bucket == bucket => last.clicks += clicks,
            _ => points.push(TimelinePoint { bucket, clicks }),
        }
    }
    points
}
