use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

pub mod azorult;
pub mod feodo;
pub mod urlhaus;

/// Feed timestamps like `2020-05-01 10:00:00`, taken as UTC.
pub fn parse_feed_datetime(raw: &str) -> Option<DateTime<Utc>> {
  NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M:%S")
    .ok()
    .map(|naive| naive.and_utc())
}

/// Date-only feed fields like `2020-05-04`, taken as UTC midnight.
pub fn parse_feed_date(raw: &str) -> Option<DateTime<Utc>> {
  raw
    .trim()
    .parse::<NaiveDate>()
    .ok()
    .and_then(|d| d.and_hms_opt(0, 0, 0))
    .map(|naive| naive.and_utc())
}
