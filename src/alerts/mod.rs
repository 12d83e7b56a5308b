//! Anomaly alerts from the trailing 24 hours against the 24 hours before

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

use crate::analytics::authorize;
use crate::analytics::plan::{Dimension, EventFilter, QueryPlan, DIRECT, UNKNOWN};
use crate::cache::{CacheKey, CacheLayer, ViewKind};
use crate::error::AnalyticsResult;
use crate::models::DateWindow;
use crate::storage::{EventStore, LinkRepository};

const SPIKE_RATIO: f64 = 3.0;
const DROP_RATIO: f64 = 0.3;
const DROP_MIN_PREVIOUS: u64 = 10;
const NEW_REFERRERS_MIN_CURRENT: u64 = 10;
const MAX_EXAMPLES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    TrafficSpike,
    TrafficDrop,
    NewCountries,
    NewReferrers,
}

impl AlertKind {
    pub fn severity(&self) -> Severity {
        match self {
            AlertKind::TrafficSpike => Severity::Warning,
            AlertKind::TrafficDrop => Severity::Critical,
            AlertKind::NewCountries | AlertKind::NewReferrers => Severity::Info,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub link_id: String,
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub current: u64,
    pub previous: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl Alert {
    fn new(link_id: &str, kind: AlertKind, message: String, current: u64, previous: u64) -> Self {
        Self {
            link_id: link_id.to_string(),
            kind,
            severity: kind.severity(),
            message,
            current,
            previous,
            values: Vec::new(),
        }
    }

    fn with_values(mut self, values: Vec<String>) -> Self {
        self.values = values;
        self
    }
}

/// Volume alerts from two consecutive window counts
pub fn volume_alerts(link_id: &str, current: u64, previous: u64) -> Vec<Alert> {
    let mut alerts = Vec::new();
    if previous == 0 {
        return alerts;
    }
    let ratio = current as f64 / previous as f64;
    if ratio > SPIKE_RATIO {
        alerts.push(Alert::new(
            link_id,
            AlertKind::TrafficSpike,
            format!("Clicks rose to {current} from {previous} in the previous 24h"),
            current,
            previous,
        ));
    }
    if previous > DROP_MIN_PREVIOUS && ratio < DROP_RATIO {
        alerts.push(Alert::new(
            link_id,
            AlertKind::TrafficDrop,
            format!("Clicks fell to {current} from {previous} in the previous 24h"),
            current,
            previous,
        ));
    }
    alerts
}

pub struct AlertEngine {
    store: Arc<dyn EventStore>,
    links: Arc<dyn LinkRepository>,
    cache: Arc<CacheLayer>,
}

impl AlertEngine {
    pub fn new(
        store: Arc<dyn EventStore>,
        links: Arc<dyn LinkRepository>,
        cache: Arc<CacheLayer>,
    ) -> Self {
        Self { store, links, cache }
    }

    pub async fn for_link(&self, caller: &str, link_id: &str) -> AnalyticsResult<Vec<Alert>> {
        authorize(self.links.as_ref(), caller, link_id).await?;
        let view = ViewKind::Alerts;
        let key = CacheKey::new(view, link_id, "link");
        self.cache
            .get_or_compute(&key, view.ttl(), || self.evaluate_at(link_id, Utc::now()))
            .await
    }

    pub async fn for_user(&self, user_id: &str) -> AnalyticsResult<Vec<Alert>> {
        let view = ViewKind::Alerts;
        let key = CacheKey::new(view, user_id, "user");
        self.cache
            .get_or_compute(&key, view.ttl(), || self.for_user_at(user_id, Utc::now()))
            .await
    }

    /// Alerts across a user's links, most severe first. Failing links are skipped.
    pub async fn for_user_at(&self, user_id: &str, now: DateTime<Utc>) -> AnalyticsResult<Vec<Alert>> {
        let mut alerts = Vec::new();
        for link_id in self.links.links_for_owner(user_id).await? {
            match self.evaluate_at(&link_id, now).await {
                Ok(found) => alerts.extend(found),
                Err(e) => warn!(link_id = %link_id, error = %e, "Skipping link in alert evaluation"),
            }
        }
        alerts.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.link_id.cmp(&b.link_id))
        });
        Ok(alerts)
    }

    pub async fn evaluate_at(&self, link_id: &str, now: DateTime<Utc>) -> AnalyticsResult<Vec<Alert>> {
        let current_window = DateWindow::trailing(now, Duration::hours(24));
        let previous_window = DateWindow::trailing(current_window.start, Duration::hours(24));
        let history_window = DateWindow {
            start: DateTime::<Utc>::UNIX_EPOCH,
            end: current_window.start,
        };

        let current_filter = EventFilter::link(link_id, Some(current_window));
        let previous_filter = EventFilter::link(link_id, Some(previous_window));
        let history_filter = EventFilter::link(link_id, Some(history_window));
        let (current, previous, history) = tokio::try_join!(
            self.store.window_stats(&current_filter),
            self.store.window_stats(&previous_filter),
            self.store.window_stats(&history_filter),
        )?;
        let (current, previous) = (current.total, previous.total);

        let mut alerts = volume_alerts(link_id, current, previous);
        if current == 0 {
            return Ok(alerts);
        }

        if history.total > 0 {
            let new_countries = self
                .new_values(&current_filter, &history_filter, Dimension::Country, UNKNOWN)
                .await?;
            if !new_countries.is_empty() {
                alerts.push(
                    Alert::new(
                        link_id,
                        AlertKind::NewCountries,
                        format!("First clicks from {}", new_countries.join(", ")),
                        current,
                        previous,
                    )
                    .with_values(new_countries),
                );
            }
        }

        if current > NEW_REFERRERS_MIN_CURRENT {
            let mut new_referrers = self
                .new_values(&current_filter, &history_filter, Dimension::ReferrerDomain, DIRECT)
                .await?;
            if !new_referrers.is_empty() {
                let count = new_referrers.len();
                new_referrers.truncate(MAX_EXAMPLES);
                alerts.push(
                    Alert::new(
                        link_id,
                        AlertKind::NewReferrers,
                        format!("{count} new referrer(s), including {}", new_referrers.join(", ")),
                        current,
                        previous,
                    )
                    .with_values(new_referrers),
                );
            }
        }

        Ok(alerts)
    }

    /// Values present now but never before, sorted, ignoring the placeholder group
    async fn new_values(
        &self,
        current: &EventFilter,
        history: &EventFilter,
        dimension: Dimension,
        placeholder: &str,
    ) -> AnalyticsResult<Vec<String>> {
        let now_plan = QueryPlan::distinct(current.clone(), dimension);
        let past_plan = QueryPlan::distinct(history.clone(), dimension);
        let (now_rows, past_rows) =
            tokio::try_join!(self.store.execute(&now_plan), self.store.execute(&past_plan))?;
        let seen: BTreeSet<String> = past_rows.into_iter().map(|r| r.key).collect();
        Ok(now_rows
            .into_iter()
            .map(|r| r.key)
            .filter(|key| key != placeholder && !seen.contains(key))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ClickEvent;
    use crate::storage::{EventSink, MemoryStore};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, 10, 12, 0, 0).unwrap()
    }

    async fn seed(store: &MemoryStore, hours_ago: i64, count: usize, country: &str, referrer: Option<&str>) {
        for i in 0..count {
            let mut e = ClickEvent::new("abc", now() - Duration::hours(hours_ago), &format!("v{i}"));
            e.location.country_code = Some(country.to_string());
            e.referrer.domain = referrer.map(str::to_string);
            store.append(e).await.unwrap();
        }
    }

    fn engine(store: Arc<MemoryStore>) -> AlertEngine {
        store.register_link("abc", "alice");
        AlertEngine::new(store.clone(), store, Arc::new(CacheLayer::disabled()))
    }

    #[test]
    fn test_volume_alert_thresholds() {
        let spike = volume_alerts("abc", 50, 10);
        assert_eq!(spike.len(), 1);
        assert_eq!(spike[0].kind, AlertKind::TrafficSpike);
        assert_eq!(spike[0].severity, Severity::Warning);

        assert!(volume_alerts("abc", 30, 10).is_empty());
        assert!(volume_alerts("abc", 5, 0).is_empty());

        let drop = volume_alerts("abc", 2, 20);
        assert_eq!(drop[0].kind, AlertKind::TrafficDrop);
        assert_eq!(drop[0].severity, Severity::Critical);

        // Too little previous traffic to call it a drop
        assert!(volume_alerts("abc", 0, 10).is_empty());
    }

    #[tokio::test]
    async fn test_new_countries_need_history() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 2, 3, "US", None).await;
        let engine = engine(store.clone());
        let alerts = engine.evaluate_at("abc", now()).await.unwrap();
        assert!(alerts.iter().all(|a| a.kind != AlertKind::NewCountries));

        seed(&store, 200, 1, "DE", None).await;
        let alerts = engine.evaluate_at("abc", now()).await.unwrap();
        let new_countries = alerts
            .iter()
            .find(|a| a.kind == AlertKind::NewCountries)
            .unwrap();
        assert_eq!(new_countries.values, vec!["US".to_string()]);
    }

    #[tokio::test]
    async fn test_new_referrers_capped_at_five_examples() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 100, 1, "US", Some("old.example")).await;
        for i in 0..7 {
            seed(&store, 1, 2, "US", Some(&format!("site{i}.example"))).await;
        }
        seed(&store, 1, 2, "US", Some("old.example")).await;
        let engine = engine(store);

        let alerts = engine.evaluate_at("abc", now()).await.unwrap();
        let referrers = alerts
            .iter()
            .find(|a| a.kind == AlertKind::NewReferrers)
            .unwrap();
        assert_eq!(referrers.values.len(), 5);
        assert!(!referrers.values.contains(&"old.example".to_string()));
        assert!(referrers.message.starts_with("7 new referrer(s)"));
    }

    #[tokio::test]
    async fn test_for_user_orders_by_severity() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 30, 20, "US", None).await;
        seed(&store, 1, 1, "FR", None).await;
        let engine = engine(store);

        let alerts = engine.for_user_at("alice", now()).await.unwrap();
        assert_eq!(alerts[0].kind, AlertKind::TrafficDrop);
        assert_eq!(alerts.last().unwrap().kind, AlertKind::NewCountries);
    }
}
