//! Store-agnostic query plans
//!
//! Every aggregation is expressed as `{filter, group_by, sort, limit, project}`.
//! Backends compile a plan to their native form: `SqliteStore` emits SQL,
//! `MemoryStore` evaluates it with [`QueryPlan::evaluate`]. Both must produce
//! the same rows for the same events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use crate::error::AnalyticsError;
use crate::models::{ClickEvent, DateWindow};

/// Group label for events with no value on the grouped dimension
pub const UNKNOWN: &str = "Unknown";

/// Group label for events with no referrer domain
pub const DIRECT: &str = "direct";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkScope {
    /// Every link in the store. Only batch jobs use this.
    All,
    Links(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventFilter {
    pub scope: LinkScope,
    pub window: Option<DateWindow>,
}

impl EventFilter {
    pub fn link(link_id: &str, window: Option<DateWindow>) -> Self {
        Self {
            scope: LinkScope::Links(vec![link_id.to_string()]),
            window,
        }
    }

    pub fn links(link_ids: &[String], window: Option<DateWindow>) -> Self {
        Self {
            scope: LinkScope::Links(link_ids.to_vec()),
            window,
        }
    }

    pub fn all(window: Option<DateWindow>) -> Self {
        Self {
            scope: LinkScope::All,
            window,
        }
    }

    pub fn matches(&self, event: &ClickEvent) -> bool {
        let in_scope = match &self.scope {
            LinkScope::All => true,
            LinkScope::Links(ids) => ids.iter().any(|id| *id == event.link_id),
        };
        in_scope
            && self
                .window
                .map_or(true, |window| window.contains(event.timestamp))
    }
}

/// Grouping dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Dimension {
    Link,
    Country,
    Region,
    City,
    DeviceType,
    DeviceBrand,
    Os,
    Browser,
    ReferrerDomain,
    ReferrerType,
    UtmSource,
    UtmMedium,
    UtmCampaign,
    /// UTC hour start as unix seconds
    Hour,
}

impl Dimension {
    /// How many groups a breakdown on this dimension keeps
    pub fn top_n(&self) -> Option<usize> {
        match self {
            Dimension::Region | Dimension::City | Dimension::UtmCampaign => Some(20),
            Dimension::ReferrerType | Dimension::Hour => None,
            _ => Some(10),
        }
    }

    /// UTM dimensions only count tagged clicks
    pub fn tagged_only(&self) -> bool {
        matches!(
            self,
            Dimension::UtmSource | Dimension::UtmMedium | Dimension::UtmCampaign
        )
    }

    /// Group key for an event, `None` when the event is excluded from this grouping
    pub fn value_of(&self, event: &ClickEvent) -> Option<String> {
        let or_unknown = |v: &Option<String>| v.clone().unwrap_or_else(|| UNKNOWN.to_string());
        match self {
            Dimension::Link => Some(event.link_id.clone()),
            Dimension::Country => Some(or_unknown(&event.location.country_code)),
            Dimension::Region => Some(or_unknown(&event.location.region)),
            Dimension::City => Some(or_unknown(&event.location.city)),
            Dimension::DeviceType => Some(event.device.device_type.as_str().to_string()),
            Dimension::DeviceBrand => Some(or_unknown(&event.device.brand)),
            Dimension::Os => Some(or_unknown(&event.os.name)),
            Dimension::Browser => Some(or_unknown(&event.browser.name)),
            Dimension::ReferrerDomain => Some(
                event
                    .referrer
                    .domain
                    .clone()
                    .unwrap_or_else(|| DIRECT.to_string()),
            ),
            Dimension::ReferrerType => Some(event.referrer.referrer_type.as_str().to_string()),
            Dimension::UtmSource => event.utm.source.clone(),
            Dimension::UtmMedium => event.utm.medium.clone(),
            Dimension::UtmCampaign => event.utm.campaign.clone(),
            Dimension::Hour => Some(hour_start(event.timestamp).to_string()),
        }
    }
}

impl FromStr for Dimension {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dimension = match s {
            "country" => Dimension::Country,
            "region" => Dimension::Region,
            "city" => Dimension::City,
            "device" | "deviceType" => Dimension::DeviceType,
            "brand" | "deviceBrand" => Dimension::DeviceBrand,
            "os" => Dimension::Os,
            "browser" => Dimension::Browser,
            "referrer" | "referrerDomain" => Dimension::ReferrerDomain,
            "referrerType" => Dimension::ReferrerType,
            "utmSource" => Dimension::UtmSource,
            "utmMedium" => Dimension::UtmMedium,
            "utmCampaign" => Dimension::UtmCampaign,
            other => {
                return Err(AnalyticsError::validation(format!(
                    "unknown dimension '{other}'"
                )))
            }
        };
        Ok(dimension)
    }
}

/// Truncate a timestamp to the start of its UTC hour, in unix seconds
pub fn hour_start(ts: DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(3600) * 3600
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortOrder {
    /// Count descending, ties broken by key ascending
    CountDesc,
    KeyAsc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Projection {
    /// Number of events per group
    Clicks,
    /// Number of distinct visitor hashes per group (exact, batch use only)
    UniqueVisitors,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCount {
    pub key: String,
    pub count: u64,
}

/// Totals and bounds for a filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowStats {
    pub total: u64,
    pub first_click: Option<DateTime<Utc>>,
    pub last_click: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryPlan {
    pub filter: EventFilter,
    pub group_by: Dimension,
    pub sort: SortOrder,
    pub limit: Option<usize>,
    pub project: Projection,
}

impl QueryPlan {
    /// Top-N click breakdown on a dimension
    pub fn breakdown(filter: EventFilter, group_by: Dimension) -> Self {
        Self {
            filter,
            group_by,
            sort: SortOrder::CountDesc,
            limit: group_by.top_n(),
            project: Projection::Clicks,
        }
    }

    /// Hourly click counts in chronological order
    pub fn hourly(filter: EventFilter) -> Self {
        Self {
            filter,
            group_by: Dimension::Hour,
            sort: SortOrder::KeyAsc,
            limit: None,
            project: Projection::Clicks,
        }
    }

    /// Every distinct value of a dimension, unlimited
    pub fn distinct(filter: EventFilter, group_by: Dimension) -> Self {
        Self {
            filter,
            group_by,
            sort: SortOrder::KeyAsc,
            limit: None,
            project: Projection::Clicks,
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_projection(mut self, project: Projection) -> Self {
        self.project = project;
        self
    }

    /// Reference evaluation over an event iterator
    pub fn evaluate<'a, I>(&self, events: I) -> Vec<GroupCount>
    where
        I: IntoIterator<Item = &'a ClickEvent>,
    {
        let mut clicks: HashMap<String, u64> = HashMap::new();
        let mut visitors: HashMap<String, HashSet<&'a str>> = HashMap::new();

        for event in events {
            if !self.filter.matches(event) {
                continue;
            }
            let Some(key) = self.group_by.value_of(event) else {
                continue;
            };
            match self.project {
                Projection::Clicks => *clicks.entry(key).or_insert(0) += 1,
                Projection::UniqueVisitors => {
                    visitors
                        .entry(key)
                        .or_default()
                        .insert(event.visitor_hash.as_str());
                }
            }
        }

        let mut rows: Vec<GroupCount> = match self.project {
            Projection::Clicks => clicks
                .into_iter()
                .map(|(key, count)| GroupCount { key, count })
                .collect(),
            Projection::UniqueVisitors => visitors
                .into_iter()
                .map(|(key, set)| GroupCount {
                    key,
                    count: set.len() as u64,
                })
                .collect(),
        };

        sort_rows(&mut rows, self.sort);
        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }
        rows
    }
}

pub fn sort_rows(rows: &mut [GroupCount], order: SortOrder) {
    match order {
        SortOrder::CountDesc => {
            rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)))
        }
        SortOrder::KeyAsc => rows.sort_by(|a, b| a.key.cmp(&b.key)),
    }
}
