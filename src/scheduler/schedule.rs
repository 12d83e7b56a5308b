//! Job kinds and their UTC wall-clock schedule

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::analytics::plan::hour_start;
use crate::error::AnalyticsError;
use crate::models::RollupPeriod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    DailyRollup,
    WeeklyRollup,
    MonthlyRollup,
    TrendingRefresh,
    Cleanup,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::DailyRollup,
        JobKind::WeeklyRollup,
        JobKind::MonthlyRollup,
        JobKind::TrendingRefresh,
        JobKind::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::DailyRollup => "daily_rollup",
            JobKind::WeeklyRollup => "weekly_rollup",
            JobKind::MonthlyRollup => "monthly_rollup",
            JobKind::TrendingRefresh => "trending_refresh",
            JobKind::Cleanup => "cleanup",
        }
    }

    pub fn rollup_period(&self) -> Option<RollupPeriod> {
        match self {
            JobKind::DailyRollup => Some(RollupPeriod::Day),
            JobKind::WeeklyRollup => Some(RollupPeriod::Week),
            JobKind::MonthlyRollup => Some(RollupPeriod::Month),
            JobKind::TrendingRefresh | JobKind::Cleanup => None,
        }
    }

    pub fn for_period(period: RollupPeriod) -> Self {
        match period {
            RollupPeriod::Day => JobKind::DailyRollup,
            RollupPeriod::Week => JobKind::WeeklyRollup,
            RollupPeriod::Month => JobKind::MonthlyRollup,
        }
    }

    /// First scheduled run strictly after `now`.
    ///
    /// Daily rollup 00:05, weekly Monday 00:30, monthly on the 1st at 01:00,
    /// trending refresh every hour on the hour, cleanup 03:00.
    pub fn next_run_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let calendar = |period: RollupPeriod, offset: Duration| {
            let current = period.window_containing(now);
            let candidate = current.start + offset;
            if candidate > now {
                candidate
            } else {
                current.end + offset
            }
        };

        match self {
            JobKind::DailyRollup => calendar(RollupPeriod::Day, Duration::minutes(5)),
            JobKind::WeeklyRollup => calendar(RollupPeriod::Week, Duration::minutes(30)),
            JobKind::MonthlyRollup => calendar(RollupPeriod::Month, Duration::hours(1)),
            JobKind::Cleanup => calendar(RollupPeriod::Day, Duration::hours(3)),
            JobKind::TrendingRefresh => {
                let next = hour_start(now) + 3600;
                DateTime::from_timestamp(next, 0).unwrap_or(now + Duration::hours(1))
            }
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| AnalyticsError::validation(format!("unknown job '{s}'")))
    }
}
