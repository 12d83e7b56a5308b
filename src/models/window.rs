use chrono::{DateTime, Duration, DurationRound, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{AnalyticsError, AnalyticsResult};

/// Half-open `[start, end)` time window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateWindow {
    /// Build a window, rejecting `end <= start`
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> AnalyticsResult<Self> {
        if end <= start {
            return Err(AnalyticsError::validation(
                "endDate must be after startDate",
            ));
        }
        Ok(Self { start, end })
    }

    /// The window of length `length` ending at `end`
    pub fn trailing(end: DateTime<Utc>, length: Duration) -> Self {
        Self {
            start: end - length,
            end,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn length(&self) -> Duration {
        self.end - self.start
    }

    /// Parse optional `startDate`/`endDate` request parameters.
    ///
    /// Both absent means "all time". A start without an end runs until now.
    pub fn from_params(
        start: Option<&str>,
        end: Option<&str>,
    ) -> AnalyticsResult<Option<Self>> {
        match (start, end) {
            (None, None) => Ok(None),
            (Some(s), None) => Self::new(parse_date(s)?, Utc::now()).map(Some),
            (None, Some(_)) => Err(AnalyticsError::validation(
                "startDate is required when endDate is given",
            )),
            (Some(s), Some(e)) => Self::new(parse_date(s)?, parse_date(e)?).map(Some),
        }
    }
}

/// Accepts RFC 3339 timestamps and plain `YYYY-MM-DD` dates (midnight UTC)
pub fn parse_date(value: &str) -> AnalyticsResult<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| AnalyticsError::validation(format!("invalid date '{value}'")))
}

/// Timeline bucket size
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    #[default]
    Day,
    Week,
    Month,
    Year,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Year => "year",
        }
    }

    /// chrono format string for bucket keys. All keys sort chronologically.
    pub fn bucket_format(&self) -> &'static str {
        match self {
            Granularity::Hour => "%Y-%m-%d %H:00",
            Granularity::Day => "%Y-%m-%d",
            Granularity::Week => "%G-W%V",
            Granularity::Month => "%Y-%m",
            Granularity::Year => "%Y",
        }
    }

    pub fn bucket_key(&self, ts: DateTime<Utc>) -> String {
        ts.format(self.bucket_format()).to_string()
    }

    /// Longest window a timeline of this granularity may cover
    pub fn max_window(&self) -> Duration {
        match self {
            Granularity::Hour => Duration::days(7),
            Granularity::Day => Duration::days(365),
            Granularity::Week => Duration::days(730),
            Granularity::Month => Duration::days(1826),
            Granularity::Year => Duration::days(3652),
        }
    }

    /// Window used when a timeline request gives no dates: the longest
    /// allowed span, ending at the close of the current hour so that
    /// requests within the same hour share a cache entry
    pub fn default_window(&self, now: DateTime<Utc>) -> DateWindow {
        let end = now.duration_trunc(Duration::hours(1)).unwrap_or(now) + Duration::hours(1);
        DateWindow::trailing(end, self.max_window())
    }

    pub fn check_window(&self, window: &DateWindow) -> AnalyticsResult<()> {
        if window.length() > self.max_window() {
            return Err(AnalyticsError::validation(format!(
                "window exceeds {} days allowed for {} granularity",
                self.max_window().num_days(),
                self.as_str()
            )));
        }
        Ok(())
    }
}

impl FromStr for Granularity {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            "year" => Ok(Granularity::Year),
            other => Err(AnalyticsError::validation(format!(
                "unknown granularity '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_rejects_inverted_bounds() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        assert!(DateWindow::new(t, t).is_err());
        assert!(DateWindow::new(t, t - Duration::hours(1)).is_err());
        assert!(DateWindow::new(t, t + Duration::hours(1)).is_ok());
    }

    #[test]
    fn test_window_is_half_open() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let window = DateWindow::new(start, start + Duration::days(1)).unwrap();
        assert!(window.contains(start));
        assert!(!window.contains(start + Duration::days(1)));
    }

    #[test]
    fn test_parse_date_formats() {
        let d = parse_date("2024-03-10").unwrap();
        assert_eq!(d, Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap());

        let d = parse_date("2024-03-10T12:30:00+02:00").unwrap();
        assert_eq!(d, Utc.with_ymd_and_hms(2024, 3, 10, 10, 30, 0).unwrap());

        assert!(parse_date("10/03/2024").is_err());
    }

    #[test]
    fn test_from_params() {
        assert!(DateWindow::from_params(None, None).unwrap().is_none());
        assert!(DateWindow::from_params(None, Some("2024-01-01")).is_err());
        assert!(DateWindow::from_params(Some("2024-01-02"), Some("2024-01-01")).is_err());

        let window = DateWindow::from_params(Some("2024-01-01"), Some("2024-01-08"))
            .unwrap()
            .unwrap();
        assert_eq!(window.length(), Duration::days(7));
    }

    #[test]
    fn test_default_window_uses_cap() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 42, 7).unwrap();
        let window = Granularity::Hour.default_window(now);
        assert_eq!(window.end, Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap());
        assert_eq!(window.length(), Duration::days(7));
        assert!(Granularity::Hour.check_window(&window).is_ok());
        assert_eq!(Granularity::Year.default_window(now).length(), Duration::days(3652));
    }

    #[test]
    fn test_bucket_keys() {
        let ts = Utc.with_ymd_and_hms(2024, 12, 30, 15, 42, 0).unwrap();
        assert_eq!(Granularity::Hour.bucket_key(ts), "2024-12-30 15:00");
        assert_eq!(Granularity::Day.bucket_key(ts), "2024-12-30");
        // ISO week 1 of 2025 starts on Monday 2024-12-30
        assert_eq!(Granularity::Week.bucket_key(ts), "2025-W01");
        assert_eq!(Granularity::Month.bucket_key(ts), "2024-12");
        assert_eq!(Granularity::Year.bucket_key(ts), "2024");
    }

    #[test]
    fn test_granularity_caps() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let eight_days = DateWindow::new(start, start + Duration::days(8)).unwrap();
        assert!(Granularity::Hour.check_window(&eight_days).is_err());
        assert!(Granularity::Day.check_window(&eight_days).is_ok());

        let two_years = DateWindow::new(start, start + Duration::days(731)).unwrap();
        assert!(Granularity::Week.check_window(&two_years).is_err());
        assert!(Granularity::Month.check_window(&two_years).is_ok());
    }

    #[test]
    fn test_parse_granularity() {
        assert_eq!("WEEK".parse::<Granularity>().unwrap(), Granularity::Week);
        assert!("quarter".parse::<Granularity>().is_err());
    }
}
