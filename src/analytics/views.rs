//! Typed results, one per cached view

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analytics::plan::Dimension;
use crate::models::{BreakdownItem, DateWindow, Granularity, TimelinePoint};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryView {
    pub link_id: String,
    pub window: Option<DateWindow>,
    pub total_clicks: u64,
    /// Approximate, all-time
    pub unique_visitors: u64,
    pub first_click: Option<DateTime<Utc>>,
    pub last_click: Option<DateTime<Utc>>,
    pub top_countries: Vec<BreakdownItem>,
    pub top_devices: Vec<BreakdownItem>,
    pub top_browsers: Vec<BreakdownItem>,
    pub top_referrers: Vec<BreakdownItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeographicView {
    pub link_id: String,
    pub window: Option<DateWindow>,
    pub total_clicks: u64,
    pub countries: Vec<BreakdownItem>,
    pub regions: Vec<BreakdownItem>,
    pub cities: Vec<BreakdownItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub link_id: String,
    pub window: Option<DateWindow>,
    pub total_clicks: u64,
    pub device_types: Vec<BreakdownItem>,
    pub brands: Vec<BreakdownItem>,
    pub operating_systems: Vec<BreakdownItem>,
    pub browsers: Vec<BreakdownItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferrerView {
    pub link_id: String,
    pub window: Option<DateWindow>,
    pub total_clicks: u64,
    pub domains: Vec<BreakdownItem>,
    pub types: Vec<BreakdownItem>,
    pub utm_sources: Vec<BreakdownItem>,
    pub utm_mediums: Vec<BreakdownItem>,
    pub utm_campaigns: Vec<BreakdownItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineView {
    pub link_id: String,
    pub window: Option<DateWindow>,
    pub granularity: Granularity,
    pub total_clicks: u64,
    pub points: Vec<TimelinePoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareEntry {
    pub link_id: String,
    pub total_clicks: u64,
    pub unique_visitors: u64,
    /// Share of the combined clicks across compared links
    pub share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareView {
    pub window: Option<DateWindow>,
    pub total_clicks: u64,
    pub links: Vec<CompareEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomReportQuery {
    pub link_ids: Vec<String>,
    pub dimensions: Vec<Dimension>,
    pub window: Option<DateWindow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionBreakdown {
    pub dimension: Dimension,
    pub items: Vec<BreakdownItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomReportView {
    pub window: Option<DateWindow>,
    pub total_clicks: u64,
    pub links: Vec<BreakdownItem>,
    pub breakdowns: Vec<DimensionBreakdown>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOverview {
    pub user_id: String,
    pub window: Option<DateWindow>,
    pub total_links: usize,
    pub total_clicks: u64,
    pub top_links: Vec<BreakdownItem>,
    pub top_countries: Vec<BreakdownItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceView {
    pub link_id: String,
    pub clicks_last_24h: u64,
    pub clicks_last_7d: u64,
    pub clicks_last_30d: u64,
    pub average_daily_clicks: f64,
    /// UTC hour of day with most clicks over the last 30 days
    pub peak_hour: Option<u32>,
    pub peak_hour_clicks: u64,
}
