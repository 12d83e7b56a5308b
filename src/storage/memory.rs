//! In-memory implementation of every storage trait
//!
//! Evaluates query plans with [`QueryPlan::evaluate`], so it doubles as the
//! reference behaviour the SQL backend is tested against.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;

use crate::analytics::plan::{EventFilter, GroupCount, QueryPlan, WindowStats};
use crate::cursor::EventCursor;
use crate::models::{ClickEvent, DateWindow, RollupPeriod, RollupRecord};
use crate::storage::{EventSink, EventStore, LinkRepository, RollupStore};

type RollupKey = (String, RollupPeriod, i64);

#[derive(Default)]
pub struct MemoryStore {
    events: RwLock<Vec<ClickEvent>>,
    next_id: AtomicI64,
    links: DashMap<String, String>,
    rollups: DashMap<RollupKey, RollupRecord>,
    watermarks: DashMap<String, DateTime<Utc>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_link(&self, link_id: &str, owner_id: &str) {
        self.links.insert(link_id.to_string(), owner_id.to_string());
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn execute(&self, plan: &QueryPlan) -> Result<Vec<GroupCount>> {
        let events = self.events.read().await;
        Ok(plan.evaluate(events.iter()))
    }

    async fn window_stats(&self, filter: &EventFilter) -> Result<WindowStats> {
        let events = self.events.read().await;
        let mut stats = WindowStats::default();
        for event in events.iter().filter(|e| filter.matches(e)) {
            stats.total += 1;
            stats.first_click = Some(match stats.first_click {
                Some(first) => first.min(event.timestamp),
                None => event.timestamp,
            });
            stats.last_click = Some(match stats.last_click {
                Some(last) => last.max(event.timestamp),
                None => event.timestamp,
            });
        }
        Ok(stats)
    }

    async fn events_page(
        &self,
        filter: &EventFilter,
        after: Option<EventCursor>,
        limit: usize,
    ) -> Result<Vec<ClickEvent>> {
        let events = self.events.read().await;
        let mut page: Vec<ClickEvent> = events
            .iter()
            .filter(|e| filter.matches(e))
            .filter(|e| match after {
                Some(cursor) => {
                    (e.timestamp.timestamp_millis(), e.id) > (cursor.timestamp_ms, cursor.id)
                }
                None => true,
            })
            .cloned()
            .collect();
        page.sort_by_key(|e| (e.timestamp.timestamp_millis(), e.id));
        page.truncate(limit);
        Ok(page)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|e| e.timestamp >= cutoff);
        Ok((before - events.len()) as u64)
    }
}

#[async_trait]
impl EventSink for MemoryStore {
    async fn append(&self, mut event: ClickEvent) -> Result<ClickEvent> {
        event.id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.events.write().await.push(event.clone());
        Ok(event)
    }
}

#[async_trait]
impl LinkRepository for MemoryStore {
    async fn lookup_owner(&self, link_id: &str) -> Result<Option<String>> {
        Ok(self.links.get(link_id).map(|owner| owner.value().clone()))
    }

    async fn links_for_owner(&self, owner_id: &str) -> Result<Vec<String>> {
        let mut links: Vec<String> = self
            .links
            .iter()
            .filter(|entry| entry.value() == owner_id)
            .map(|entry| entry.key().clone())
            .collect();
        links.sort();
        Ok(links)
    }
}

#[async_trait]
impl RollupStore for MemoryStore {
    async fn upsert_rollup(&self, record: &RollupRecord) -> Result<()> {
        let key = (
            record.link_id.clone(),
            record.period,
            record.period_start.timestamp(),
        );
        self.rollups.insert(key, record.clone());
        Ok(())
    }

    async fn get_rollup(
        &self,
        link_id: &str,
        period: RollupPeriod,
        period_start: DateTime<Utc>,
    ) -> Result<Option<RollupRecord>> {
        let key = (link_id.to_string(), period, period_start.timestamp());
        Ok(self.rollups.get(&key).map(|r| r.value().clone()))
    }

    async fn list_rollups(
        &self,
        link_id: &str,
        period: RollupPeriod,
        window: Option<DateWindow>,
    ) -> Result<Vec<RollupRecord>> {
        let mut records: Vec<RollupRecord> = self
            .rollups
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|r| r.link_id == link_id && r.period == period)
            .filter(|r| window.map_or(true, |w| w.contains(r.period_start)))
            .collect();
        records.sort_by_key(|r| r.period_start);
        Ok(records)
    }

    async fn get_watermark(&self, job: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.watermarks.get(job).map(|w| *w.value()))
    }

    async fn advance_watermark(&self, job: &str, watermark: DateTime<Utc>) -> Result<()> {
        self.watermarks
            .entry(job.to_string())
            .and_modify(|current| {
                if watermark > *current {
                    *current = watermark;
                }
            })
            .or_insert(watermark);
        Ok(())
    }
}
