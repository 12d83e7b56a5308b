//! Click analytics: query plans, visitor counting and the aggregation engine

pub mod aggregator;
pub mod ingest;
pub mod plan;
pub mod views;
pub mod visitors;

pub use aggregator::AggregationEngine;
pub use ingest::ClickRecorder;
pub use plan::{Dimension, EventFilter, QueryPlan};
pub use visitors::{UniqueVisitorTracker, VisitorHasher};

use crate::error::{AnalyticsError, AnalyticsResult};
use crate::storage::LinkRepository;

/// Unknown links are `NotFound`, links owned by someone else are `Forbidden`
pub async fn authorize(
    links: &dyn LinkRepository,
    caller: &str,
    link_id: &str,
) -> AnalyticsResult<()> {
    match links.lookup_owner(link_id).await? {
        None => Err(AnalyticsError::NotFound(link_id.to_string())),
        Some(owner) if owner != caller => Err(AnalyticsError::Forbidden(link_id.to_string())),
        Some(_) => Ok(()),
    }
}
