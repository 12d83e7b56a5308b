//! Period-over-period growth ranking

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::analytics::plan::EventFilter;
use crate::cache::{CacheKey, CacheLayer, ViewKind};
use crate::error::{AnalyticsError, AnalyticsResult};
use crate::models::{round2, DateWindow};
use crate::storage::{EventStore, LinkRepository};

pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendPeriod {
    #[default]
    Day,
    Week,
    Month,
}

impl TrendPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendPeriod::Day => "day",
            TrendPeriod::Week => "week",
            TrendPeriod::Month => "month",
        }
    }

    pub fn length(&self) -> Duration {
        match self {
            TrendPeriod::Day => Duration::days(1),
            TrendPeriod::Week => Duration::days(7),
            TrendPeriod::Month => Duration::days(30),
        }
    }

    /// `(current, previous)` windows ending at `now`
    pub fn windows(&self, now: DateTime<Utc>) -> (DateWindow, DateWindow) {
        let current = DateWindow::trailing(now, self.length());
        let previous = DateWindow::trailing(current.start, self.length());
        (current, previous)
    }
}

impl FromStr for TrendPeriod {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "day" => Ok(TrendPeriod::Day),
            "week" => Ok(TrendPeriod::Week),
            "month" => Ok(TrendPeriod::Month),
            other => Err(AnalyticsError::validation(format!(
                "unknown trend period '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendRecord {
    pub link_id: String,
    pub current_window_count: u64,
    pub previous_window_count: u64,
    pub growth_rate: i64,
    pub growth_percentage: f64,
}

impl TrendRecord {
    pub fn new(link_id: &str, current: u64, previous: u64) -> Self {
        Self {
            link_id: link_id.to_string(),
            current_window_count: current,
            previous_window_count: previous,
            growth_rate: current as i64 - previous as i64,
            growth_percentage: growth_percentage(current, previous),
        }
    }
}

/// 100 when growing from nothing, 0 when both are zero
pub fn growth_percentage(current: u64, previous: u64) -> f64 {
    match (current, previous) {
        (0, 0) => 0.0,
        (_, 0) => 100.0,
        _ => round2((current as f64 - previous as f64) / previous as f64 * 100.0),
    }
}

/// Growth percentage desc, then growth rate desc, then link id asc
pub fn rank(records: &mut [TrendRecord]) {
    records.sort_by(|a, b| {
        b.growth_percentage
            .partial_cmp(&a.growth_percentage)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.growth_rate.cmp(&a.growth_rate))
            .then_with(|| a.link_id.cmp(&b.link_id))
    });
}

pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

pub struct TrendEngine {
    store: Arc<dyn EventStore>,
    links: Arc<dyn LinkRepository>,
    cache: Arc<CacheLayer>,
}

impl TrendEngine {
    pub fn new(
        store: Arc<dyn EventStore>,
        links: Arc<dyn LinkRepository>,
        cache: Arc<CacheLayer>,
    ) -> Self {
        Self { store, links, cache }
    }

    pub async fn compute_trend(&self, link_id: &str, period: TrendPeriod) -> AnalyticsResult<TrendRecord> {
        self.compute_trend_at(link_id, period, Utc::now()).await
    }

    pub async fn compute_trend_at(
        &self,
        link_id: &str,
        period: TrendPeriod,
        now: DateTime<Utc>,
    ) -> AnalyticsResult<TrendRecord> {
        let (current, previous) = period.windows(now);
        let current_filter = EventFilter::link(link_id, Some(current));
        let previous_filter = EventFilter::link(link_id, Some(previous));
        let (current, previous) = tokio::try_join!(
            self.store.window_stats(&current_filter),
            self.store.window_stats(&previous_filter),
        )?;
        Ok(TrendRecord::new(link_id, current.total, previous.total))
    }

    /// Top growing links for a user, cached for an hour
    pub async fn get_for_user(
        &self,
        user_id: &str,
        period: TrendPeriod,
        limit: Option<usize>,
    ) -> AnalyticsResult<Vec<TrendRecord>> {
        let limit = clamp_limit(limit);
        let view = ViewKind::Trending;
        let key = CacheKey::new(view, user_id, &(period, limit));
        self.cache
            .get_or_compute(&key, view.ttl(), || {
                self.rank_for_user(user_id, period, limit, Utc::now())
            })
            .await
    }

    /// Recompute and overwrite the cached default trending view
    pub async fn refresh_for_user(&self, user_id: &str, period: TrendPeriod) -> AnalyticsResult<usize> {
        let limit = clamp_limit(None);
        let records = self.rank_for_user(user_id, period, limit, Utc::now()).await?;
        let view = ViewKind::Trending;
        let key = CacheKey::new(view, user_id, &(period, limit));
        self.cache.set(&key, &records, view.ttl()).await;
        Ok(records.len())
    }

    /// Uncached ranking. Links that fail are logged and left out.
    pub async fn rank_for_user(
        &self,
        user_id: &str,
        period: TrendPeriod,
        limit: usize,
        now: DateTime<Utc>,
    ) -> AnalyticsResult<Vec<TrendRecord>> {
        let link_ids = self.links.links_for_owner(user_id).await?;
        let mut records = Vec::new();
        let mut failed = 0usize;

        for link_id in &link_ids {
            match self.compute_trend_at(link_id, period, now).await {
                Ok(record) if record.current_window_count > 0 => records.push(record),
                Ok(_) => {}
                Err(e) => {
                    failed += 1;
                    warn!(link_id = %link_id, error = %e, "Skipping link in trend ranking");
                }
            }
        }

        rank(&mut records);
        records.truncate(limit);
        if failed > 0 {
            info!(user_id = %user_id, failed, total = link_ids.len(), "Trend ranking completed with failures");
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_percentage_rules() {
        assert_eq!(growth_percentage(50, 10), 400.0);
        assert_eq!(growth_percentage(5, 0), 100.0);
        assert_eq!(growth_percentage(0, 0), 0.0);
        assert_eq!(growth_percentage(0, 5), -100.0);
        assert_eq!(growth_percentage(2, 3), -33.33);
    }

    #[test]
    fn test_rank_is_deterministic() {
        let mut a = vec![
            TrendRecord::new("b", 20, 10),
            TrendRecord::new("a", 20, 10),
            TrendRecord::new("c", 4, 2),
            TrendRecord::new("d", 50, 10),
        ];
        let mut b = a.clone();
        b.reverse();
        rank(&mut a);
        rank(&mut b);

        assert_eq!(a, b);
        let order: Vec<&str> = a.iter().map(|r| r.link_id.as_str()).collect();
        // a/b and c all grow 100%; a/b win on rate, then on id
        assert_eq!(order, vec!["d", "a", "b", "c"]);
    }

    #[test]
    fn test_limit_clamped() {
        assert_eq!(clamp_limit(None), 10);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(500)), 50);
    }

    #[test]
    fn test_windows_are_adjacent() {
        let now = Utc::now();
        let (current, previous) = TrendPeriod::Week.windows(now);
        assert_eq!(previous.end, current.start);
        assert_eq!(current.length(), Duration::days(7));
    }
}
