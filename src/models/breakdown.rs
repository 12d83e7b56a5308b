use serde::{Deserialize, Serialize};

/// One row of a grouped breakdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakdownItem {
    pub value: String,
    pub count: u64,
    pub percentage: f64,
}

/// One bucket of a time series
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelinePoint {
    pub bucket: String,
    pub clicks: u64,
}

/// `count / max(total, 1) * 100`, rounded to two decimals. Never NaN.
pub fn percentage(count: u64, total: u64) -> f64 {
    round2(count as f64 / total.max(1) as f64 * 100.0)
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
