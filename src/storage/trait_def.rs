use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::analytics::plan::{EventFilter, GroupCount, QueryPlan, WindowStats};
use crate::cursor::EventCursor;
use crate::models::{ClickEvent, DateWindow, RollupPeriod, RollupRecord};

/// Read access to immutable click events
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Run a grouped aggregation
    async fn execute(&self, plan: &QueryPlan) -> Result<Vec<GroupCount>>;

    /// Total count plus first/last click for a filter
    async fn window_stats(&self, filter: &EventFilter) -> Result<WindowStats>;

    /// Events ordered by (timestamp, id), strictly after `after`
    async fn events_page(
        &self,
        filter: &EventFilter,
        after: Option<EventCursor>,
        limit: usize,
    ) -> Result<Vec<ClickEvent>>;

    /// Delete events older than `cutoff`, returning how many were removed
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Write side used by the redirect path. Analytics reads never call this.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Append an event and return it with its store-assigned id
    async fn append(&self, event: ClickEvent) -> Result<ClickEvent>;
}

/// Ownership lookups against the link catalogue
#[async_trait]
pub trait LinkRepository: Send + Sync {
    async fn lookup_owner(&self, link_id: &str) -> Result<Option<String>>;

    async fn links_for_owner(&self, owner_id: &str) -> Result<Vec<String>>;
}

/// Durable rollup records plus per-job watermarks
#[async_trait]
pub trait RollupStore: Send + Sync {
    /// Insert or overwrite the record keyed by (link, period, period start)
    async fn upsert_rollup(&self, record: &RollupRecord) -> Result<()>;

    async fn get_rollup(
        &self,
        link_id: &str,
        period: RollupPeriod,
        period_start: DateTime<Utc>,
    ) -> Result<Option<RollupRecord>>;

    /// Rollups whose period starts inside `window`, oldest first
    async fn list_rollups(
        &self,
        link_id: &str,
        period: RollupPeriod,
        window: Option<DateWindow>,
    ) -> Result<Vec<RollupRecord>>;

    async fn get_watermark(&self, job: &str) -> Result<Option<DateTime<Utc>>>;

    /// Record that everything before `watermark` is covered by `job`.
    /// Watermarks only move forward.
    async fn advance_watermark(&self, job: &str, watermark: DateTime<Utc>) -> Result<()>;
}
