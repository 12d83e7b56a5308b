use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::AnalyticsError;
use crate::models::breakdown::{BreakdownItem, TimelinePoint};
use crate::models::window::DateWindow;

/// Calendar period a rollup covers (UTC, weeks start on Monday)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollupPeriod {
    Day,
    Week,
    Month,
}

impl RollupPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollupPeriod::Day => "day",
            RollupPeriod::Week => "week",
            RollupPeriod::Month => "month",
        }
    }

    /// The period that contains `ts`
    pub fn window_containing(&self, ts: DateTime<Utc>) -> DateWindow {
        let date = ts.date_naive();
        let (start, end) = match self {
            RollupPeriod::Day => (date, date + Duration::days(1)),
            RollupPeriod::Week => {
                let monday = date - Duration::days(date.weekday().num_days_from_monday() as i64);
                (monday, monday + Duration::days(7))
            }
            RollupPeriod::Month => {
                let first = first_of_month(date.year(), date.month());
                let next = if date.month() == 12 {
                    first_of_month(date.year() + 1, 1)
                } else {
                    first_of_month(date.year(), date.month() + 1)
                };
                (first, next)
            }
        };
        DateWindow {
            start: midnight(start),
            end: midnight(end),
        }
    }

    /// The last period that ended at or before `now`
    pub fn previous_window(&self, now: DateTime<Utc>) -> DateWindow {
        let current = self.window_containing(now);
        self.window_containing(current.start - Duration::seconds(1))
    }
}

impl FromStr for RollupPeriod {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "day" | "daily" => Ok(RollupPeriod::Day),
            "week" | "weekly" => Ok(RollupPeriod::Week),
            "month" | "monthly" => Ok(RollupPeriod::Month),
            other => Err(AnalyticsError::validation(format!(
                "unknown rollup period '{other}'"
            ))),
        }
    }
}

fn first_of_month(year: i32, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN)
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc()
}

/// Precomputed per-link summary for one calendar period.
///
/// Contains nothing time-of-computation dependent, so recomputing the same
/// historical window yields an identical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupRecord {
    pub link_id: String,
    pub period: RollupPeriod,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_clicks: u64,
    pub unique_visitors: u64,
    pub top_countries: Vec<BreakdownItem>,
    pub top_devices: Vec<BreakdownItem>,
    pub top_referrers: Vec<BreakdownItem>,
    /// Daily points for weekly rollups, weekly points for monthly rollups
    pub breakdown: Vec<TimelinePoint>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_day_window() {
        let ts = Utc.with_ymd_and_hms(2024, 2, 29, 13, 5, 0).unwrap();
        let w = RollupPeriod::Day.window_containing(ts);
        assert_eq!(w.start, Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap());
        assert_eq!(w.end, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_week_window_starts_monday() {
        // 2024-05-16 is a Thursday
        let ts = Utc.with_ymd_and_hms(2024, 5, 16, 8, 0, 0).unwrap();
        let w = RollupPeriod::Week.window_containing(ts);
        assert_eq!(w.start, Utc.with_ymd_and_hms(2024, 5, 13, 0, 0, 0).unwrap());
        assert_eq!(w.end, Utc.with_ymd_and_hms(2024, 5, 20, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_month_window_wraps_year() {
        let ts = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
        let w = RollupPeriod::Month.window_containing(ts);
        assert_eq!(w.start, Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(w.end, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_previous_window() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 5, 0).unwrap();
        let day = RollupPeriod::Day.previous_window(now);
        assert_eq!(day.start, Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap());

        let month = RollupPeriod::Month.previous_window(now);
        assert_eq!(month.start, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        assert_eq!(month.end, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
    }
}
