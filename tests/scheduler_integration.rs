//! Batch rollup behaviour under partial failure and overlapping runs

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use linkpulse::analytics::plan::{EventFilter, GroupCount, LinkScope, QueryPlan, WindowStats};
use linkpulse::analytics::{AggregationEngine, UniqueVisitorTracker};
use linkpulse::cache::CacheLayer;
use linkpulse::config::SchedulerConfig;
use linkpulse::cursor::EventCursor;
use linkpulse::models::{ClickEvent, DateWindow, RollupPeriod};
use linkpulse::scheduler::{BatchRollupScheduler, JobKind, RunOutcome, DAILY_WATERMARK};
use linkpulse::storage::{EventSink, EventStore, MemoryStore, RollupStore};
use linkpulse::trends::TrendEngine;
use std::sync::Arc;
use std::time::Duration;

/// Delegates to a memory store, failing per-link queries for one link
/// (optionally only inside one window) and delaying every call
struct FlakyStore {
    inner: Arc<MemoryStore>,
    broken_link: Option<String>,
    broken_window: Option<DateWindow>,
    delay: Duration,
}

impl FlakyStore {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            broken_link: None,
            broken_window: None,
            delay: Duration::ZERO,
        }
    }

    async fn check(&self, filter: &EventFilter) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        let in_window = self.broken_window.is_none() || self.broken_window == filter.window;
        if let (Some(broken), LinkScope::Links(ids)) = (&self.broken_link, &filter.scope) {
            if in_window && ids.iter().any(|id| id == broken) {
                return Err(anyhow!("disk read error for {broken}"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for FlakyStore {
    async fn execute(&self, plan: &QueryPlan) -> Result<Vec<GroupCount>> {
        self.check(&plan.filter).await?;
        self.inner.execute(plan).await
    }

    async fn window_stats(&self, filter: &EventFilter) -> Result<WindowStats> {
        self.check(filter).await?;
        self.inner.window_stats(filter).await
    }

    async fn events_page(
        &self,
        filter: &EventFilter,
        after: Option<EventCursor>,
        limit: usize,
    ) -> Result<Vec<ClickEvent>> {
        self.check(filter).await?;
        self.inner.events_page(filter, after, limit).await
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.inner.purge_before(cutoff).await
    }
}

fn day() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
}

async fn seeded_store(links: &[&str]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for (i, link) in links.iter().enumerate() {
        store.register_link(link, "alice");
        for j in 0..3 {
            let ts = day() + chrono::Duration::hours((i + j) as i64);
            let mut event = ClickEvent::new(*link, ts, format!("visitor-{j}"));
            event.location.country_code = Some(if j == 0 { "DE" } else { "US" }.to_string());
            store.append(event).await.unwrap();
        }
    }
    store
}

fn scheduler_over(events: Arc<dyn EventStore>, memory: Arc<MemoryStore>) -> BatchRollupScheduler {
    scheduler_with_retention(events, memory, 730)
}

fn scheduler_with_retention(
    events: Arc<dyn EventStore>,
    memory: Arc<MemoryStore>,
    retention_days: i64,
) -> BatchRollupScheduler {
    let cache = Arc::new(CacheLayer::disabled());
    let engine = Arc::new(AggregationEngine::new(
        events.clone(),
        memory.clone(),
        Arc::new(UniqueVisitorTracker::new(100)),
        cache.clone(),
    ));
    let trends = Arc::new(TrendEngine::new(events, memory.clone(), cache));
    BatchRollupScheduler::new(
        engine,
        trends,
        memory,
        SchedulerConfig {
            concurrency: 2,
            link_timeout_secs: 5,
            ..SchedulerConfig::default()
        },
        retention_days,
    )
}

#[tokio::test]
async fn test_failing_link_is_excluded_from_run() {
    let links = ["a1", "a2", "a3", "a4", "a5"];
    let memory = seeded_store(&links).await;
    let flaky = Arc::new(FlakyStore {
        broken_link: Some("a3".to_string()),
        ..FlakyStore::new(memory.clone())
    });
    let scheduler = scheduler_over(flaky, memory.clone());

    let report = scheduler
        .rollup(RollupPeriod::Day, RollupPeriod::Day.window_containing(day()))
        .await
        .unwrap();

    assert_eq!(report.total, 5);
    assert_eq!(report.processed, 4);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failed_links, vec!["a3".to_string()]);

    for link in links {
        let stored = memory
            .get_rollup(link, RollupPeriod::Day, day())
            .await
            .unwrap();
        assert_eq!(stored.is_some(), link != "a3", "link {link}");
    }

    // A partial run pins the watermark at the start of the day
    assert_eq!(
        memory.get_watermark(DAILY_WATERMARK).await.unwrap(),
        Some(day())
    );
}

#[tokio::test]
async fn test_clean_day_after_failed_day_keeps_raw_events() {
    let next_day = day() + chrono::Duration::days(1);
    let memory = Arc::new(MemoryStore::new());
    memory.register_link("a1", "alice");
    memory.register_link("a2", "alice");
    memory
        .append(ClickEvent::new("a1", day() + chrono::Duration::hours(10), "v1"))
        .await
        .unwrap();
    memory
        .append(ClickEvent::new("a2", next_day + chrono::Duration::hours(10), "v2"))
        .await
        .unwrap();

    let failed_day = RollupPeriod::Day.window_containing(day());
    let flaky = Arc::new(FlakyStore {
        broken_link: Some("a1".to_string()),
        broken_window: Some(failed_day),
        ..FlakyStore::new(memory.clone())
    });
    let scheduler = scheduler_with_retention(flaky, memory.clone(), 0);

    let first = scheduler.rollup(RollupPeriod::Day, failed_day).await.unwrap();
    assert_eq!(first.failed, 1);
    let second = scheduler
        .rollup(RollupPeriod::Day, RollupPeriod::Day.window_containing(next_day))
        .await
        .unwrap();
    assert_eq!(second.failed, 0);
    assert_eq!(
        memory.get_watermark(DAILY_WATERMARK).await.unwrap(),
        Some(day())
    );

    let cleanup = scheduler
        .cleanup(day() + chrono::Duration::days(3))
        .await
        .unwrap();
    assert_eq!(cleanup.cutoff, Some(day()));
    assert_eq!(cleanup.purged, 0);
    assert_eq!(memory.len().await, 2);
    assert!(memory
        .get_rollup("a1", RollupPeriod::Day, day())
        .await
        .unwrap()
        .is_none());

    // Once the store recovers, the next scheduled run retries the failed day
    // and the watermark catches up over both days
    let healthy = scheduler_with_retention(memory.clone(), memory.clone(), 0);
    let now = day() + chrono::Duration::days(2) + chrono::Duration::minutes(5);
    let record = healthy.run_job(JobKind::DailyRollup, now).await;
    assert_eq!(record.outcome, RunOutcome::Succeeded);
    assert_eq!(record.failed, 0);
    assert!(memory
        .get_rollup("a1", RollupPeriod::Day, day())
        .await
        .unwrap()
        .is_some());
    assert_eq!(
        memory.get_watermark(DAILY_WATERMARK).await.unwrap(),
        Some(day() + chrono::Duration::days(2))
    );
}

#[tokio::test]
async fn test_rollup_rerun_is_idempotent() {
    let memory = seeded_store(&["a1", "a2"]).await;
    let scheduler = scheduler_over(memory.clone(), memory.clone());
    let window = RollupPeriod::Day.window_containing(day());

    scheduler.rollup(RollupPeriod::Day, window).await.unwrap();
    let first = memory
        .list_rollups("a1", RollupPeriod::Day, None)
        .await
        .unwrap();

    scheduler.rollup(RollupPeriod::Day, window).await.unwrap();
    let second = memory
        .list_rollups("a1", RollupPeriod::Day, None)
        .await
        .unwrap();

    assert_eq!(first.len(), 1);
    assert_eq!(first, second);
    assert_eq!(first[0].total_clicks, 3);
    assert_eq!(first[0].unique_visitors, 3);
    assert_eq!(first[0].top_countries[0].value, "US");
    assert_eq!(first[0].top_countries[0].percentage, 66.67);
    assert_eq!(
        memory.get_watermark(DAILY_WATERMARK).await.unwrap(),
        Some(window.end)
    );
}

#[tokio::test]
async fn test_overlapping_tick_is_skipped() {
    let memory = seeded_store(&["a1"]).await;
    let slow = Arc::new(FlakyStore {
        delay: Duration::from_millis(100),
        ..FlakyStore::new(memory.clone())
    });
    let scheduler = scheduler_over(slow, memory);
    let now = Utc.with_ymd_and_hms(2024, 3, 5, 0, 5, 0).unwrap();

    let (first, second) = tokio::join!(
        scheduler.run_job(JobKind::DailyRollup, now),
        scheduler.run_job(JobKind::DailyRollup, now),
    );

    let outcomes = [first.outcome, second.outcome];
    assert!(outcomes.contains(&RunOutcome::Succeeded));
    assert!(outcomes.contains(&RunOutcome::Skipped));

    // The flag is released once the winning run ends
    let again = scheduler.run_job(JobKind::DailyRollup, now).await;
    assert_eq!(again.outcome, RunOutcome::Succeeded);
    assert_eq!(scheduler.history().await.len(), 3);
}

#[tokio::test]
async fn test_enumeration_failure_aborts_run() {
    let memory = seeded_store(&["a1"]).await;
    let broken = Arc::new(FlakyStore::new(memory.clone()));

    struct NoListing(Arc<FlakyStore>);

    #[async_trait]
    impl EventStore for NoListing {
        async fn execute(&self, plan: &QueryPlan) -> Result<Vec<GroupCount>> {
            if plan.filter.scope == LinkScope::All {
                return Err(anyhow!("connection reset"));
            }
            self.0.execute(plan).await
        }

        async fn window_stats(&self, filter: &EventFilter) -> Result<WindowStats> {
            self.0.window_stats(filter).await
        }

        async fn events_page(
            &self,
            filter: &EventFilter,
            after: Option<EventCursor>,
            limit: usize,
        ) -> Result<Vec<ClickEvent>> {
            self.0.events_page(filter, after, limit).await
        }

        async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
            self.0.purge_before(cutoff).await
        }
    }

    let scheduler = scheduler_over(Arc::new(NoListing(broken)), memory);
    let now = Utc.with_ymd_and_hms(2024, 3, 5, 0, 5, 0).unwrap();
    let record = scheduler.run_job(JobKind::DailyRollup, now).await;

    match record.outcome {
        RunOutcome::Failed { message } => assert!(message.contains("enumerate")),
        other => panic!("expected failure, got {other:?}"),
    }
}
