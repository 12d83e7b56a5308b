//! Write path used by the redirect service

use anyhow::Result;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use crate::analytics::visitors::{UniqueVisitorTracker, VisitorHasher};
use crate::models::ClickEvent;
use crate::storage::EventSink;

/// Hashes the client IP, appends the event and feeds the visitor tracker.
/// The raw IP never leaves this function.
pub struct ClickRecorder {
    sink: Arc<dyn EventSink>,
    visitors: Arc<UniqueVisitorTracker>,
    hasher: VisitorHasher,
}

impl ClickRecorder {
    pub fn new(
        sink: Arc<dyn EventSink>,
        visitors: Arc<UniqueVisitorTracker>,
        hasher: VisitorHasher,
    ) -> Self {
        Self {
            sink,
            visitors,
            hasher,
        }
    }

    pub async fn record(&self, mut event: ClickEvent, client_ip: IpAddr) -> Result<ClickEvent> {
        event.visitor_hash = self.hasher.hash(client_ip);
        let stored = self.sink.append(event).await?;
        self.visitors.add(&stored.link_id, &stored.visitor_hash);
        debug!(link_id = %stored.link_id, id = stored.id, "Recorded click");
        Ok(stored)
    }
}
