use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Interval for date histogram facets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateInterval {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl DateInterval {
    pub fn parse_interval(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hour" => Some(DateInterval::Hour),
            "day" => Some(DateInterval::Day),
            "week" => Some(DateInterval::Week),
            "month" => Some(DateInterval::Month),
            "year" => Some(DateInterval::Year),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DateInterval::Hour => "hour",
            DateInterval::Day => "day",
            DateInterval::Week => "week",
            DateInterval::Month => "month",
            DateInterval::Year => "year",
        }
    }

    /// Bucket label format, in the backend's date pattern syntax
    pub fn backend_format(&self) -> &'static str {
        match self {
            DateInterval::Hour => "yyyy-MM-dd HH:mm",
            DateInterval::Day | DateInterval::Week => "yyyy-MM-dd",
            DateInterval::Month => "yyyy-MM",
            DateInterval::Year => "yyyy",
        }
    }

    fn chrono_format(&self) -> &'static str {
        match self {
            DateInterval::Hour => "%Y-%m-%d %H:%M",
            DateInterval::Day | DateInterval::Week => "%Y-%m-%d",
            DateInterval::Month => "%Y-%m",
            DateInterval::Year => "%Y",
        }
    }

    /// Round timestamp down to interval boundary
    pub fn floor(&self, dt: DateTime<Utc>) -> DateTime<Utc> {
        let date = dt.date_naive();
        let start = match self {
            DateInterval::Hour => date.and_hms_opt(dt.hour(), 0, 0),
            DateInterval::Day => date.and_hms_opt(0, 0, 0),
            DateInterval::Week => {
                let days_from_monday = date.weekday().num_days_from_monday() as i64;
                (date - Duration::days(days_from_monday)).and_hms_opt(0, 0, 0)
            }
            DateInterval::Month => {
                NaiveDate::from_ymd_opt(date.year(), date.month(), 1).and_then(|d| d.and_hms_opt(0, 0, 0))
            }
            DateInterval::Year => {
                NaiveDate::from_ymd_opt(date.year(), 1, 1).and_then(|d| d.and_hms_opt(0, 0, 0))
            }
        };
        start.map(|naive| Utc.from_utc_datetime(&naive)).unwrap_or(dt)
    }

    /// Start of the following bucket
    pub fn next(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            DateInterval::Hour => start + Duration::hours(1),
            DateInterval::Day => start + Duration::days(1),
            DateInterval::Week => start + Duration::weeks(1),
            DateInterval::Month => {
                let (year, month) = if start.month() == 12 {
                    (start.year() + 1, 1)
                } else {
                    (start.year(), start.month() + 1)
                };
                Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
                    .single()
                    .unwrap_or(start + Duration::days(31))
            }
            DateInterval::Year => Utc
                .with_ymd_and_hms(start.year() + 1, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or(start + Duration::days(366)),
        }
    }

    /// Label of the bucket holding `dt`
    pub fn label(&self, dt: DateTime<Utc>) -> String {
        self.floor(dt).format(self.chrono_format()).to_string()
    }

    /// `[start, end)` of the bucket a label names
    pub fn bucket_bounds(&self, label: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let label = label.trim();
        let naive = match self {
            DateInterval::Hour => NaiveDateTime::parse_from_str(label, self.chrono_format()).ok()?,
            DateInterval::Day | DateInterval::Week => NaiveDate::parse_from_str(label, "%Y-%m-%d")
                .ok()?
                .and_hms_opt(0, 0, 0)?,
            DateInterval::Month => NaiveDate::parse_from_str(&format!("{}-01", label), "%Y-%m-%d")
                .ok()?
                .and_hms_opt(0, 0, 0)?,
            DateInterval::Year => NaiveDate::from_ymd_opt(label.parse().ok()?, 1, 1)?.and_hms_opt(0, 0, 0)?,
        };
        let start = self.floor(Utc.from_utc_datetime(&naive));
        Some((start, self.next(start)))
    }
}

/// Interpret a stored document value as a timestamp.
///
/// Accepts RFC 3339 strings, naive `YYYY-MM-DDTHH:MM:SS` strings, plain
/// dates and epoch milliseconds.
pub fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 42).unwrap()
    }

    #[test]
    fn test_date_interval_from_str() {
        assert_eq!(DateInterval::parse_interval("Day"), Some(DateInterval::Day));
        assert_eq!(DateInterval::parse_interval("YEAR"), Some(DateInterval::Year));
        assert_eq!(DateInterval::parse_interval("fortnight"), None);
    }

    #[test]
    fn test_floor() {
        let dt = at(2014, 5, 15, 14, 35);
        assert_eq!(DateInterval::Hour.floor(dt), Utc.with_ymd_and_hms(2014, 5, 15, 14, 0, 0).unwrap());
        assert_eq!(DateInterval::Day.floor(dt), Utc.with_ymd_and_hms(2014, 5, 15, 0, 0, 0).unwrap());
        // 2014-05-15 is a Thursday
        assert_eq!(DateInterval::Week.floor(dt), Utc.with_ymd_and_hms(2014, 5, 12, 0, 0, 0).unwrap());
        assert_eq!(DateInterval::Month.floor(dt), Utc.with_ymd_and_hms(2014, 5, 1, 0, 0, 0).unwrap());
        assert_eq!(DateInterval::Year.floor(dt), Utc.with_ymd_and_hms(2014, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_labels_round_trip_to_bounds() {
        let dt = at(2013, 12, 3, 8, 0);
        for interval in [
            DateInterval::Hour,
            DateInterval::Day,
            DateInterval::Week,
            DateInterval::Month,
            DateInterval::Year,
        ] {
            let label = interval.label(dt);
            let (start, end) = interval.bucket_bounds(&label).unwrap();
            assert!(start <= dt && dt < end, "{:?} {}", interval, label);
        }
        assert_eq!(DateInterval::Year.label(dt), "2013");
        assert_eq!(DateInterval::Month.label(dt), "2013-12");
    }

    #[test]
    fn test_month_rolls_over_year() {
        let start = Utc.with_ymd_and_hms(2013, 12, 1, 0, 0, 0).unwrap();
        assert_eq!(
            DateInterval::Month.next(start),
            Utc.with_ymd_and_hms(2014, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_date_shapes() {
        let expected = Utc.with_ymd_and_hms(2014, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_date(&json!("2014-03-01")), Some(expected));
        assert_eq!(parse_date(&json!("2014-03-01T00:00:00Z")), Some(expected));
        assert_eq!(parse_date(&json!("2014-03-01T00:00:00")), Some(expected));
        assert_eq!(parse_date(&json!(expected.timestamp_millis())), Some(expected));
        assert_eq!(parse_date(&json!("soon")), None);
    }
}
