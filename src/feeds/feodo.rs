use crate::types::{FeedSource, Indicator, IndicatorStatus, IndicatorType};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

/// Fixed column order of the Feodo Tracker IP blocklist CSV.
#[derive(Debug, Deserialize)]
struct FeodoRow {
  firstseen: String,
  dst_ip: String,
  dst_port: u16,
  last_online: Option<String>,
  malware: Option<String>,
}

pub fn parse(text: &str) -> Vec<Indicator> {
  let mut reader = csv::ReaderBuilder::new()
    .has_headers(false)
    .comment(Some(b'#'))
    .trim(csv::Trim::All)
    .flexible(true)
    .from_reader(text.as_bytes());

  let mut out = Vec::new();
  for (line, row) in reader.deserialize::<FeodoRow>().enumerate() {
    let row = match row {
      Ok(r) => r,
      Err(e) => {
        tracing::warn!(line, error = %e, "skipping malformed Feodo row");
        continue;
      }
    };
    match normalize(row) {
      Some(indicator) => out.push(indicator),
      None => tracing::warn!(line, "skipping Feodo row with unparsable Firstseen"),
    }
  }
  out
}

fn normalize(row: FeodoRow) -> Option<Indicator> {
  let first_seen = super::parse_feed_datetime(&row.firstseen)?;
  let last_seen = derive_last_seen(first_seen, row.last_online.as_deref());

  let mut tags = vec![FeedSource::FeodoTracker.source_tag().to_string()];
  if let Some(malware) = &row.malware {
    if !malware.trim().is_empty() {
      tags.push(malware.trim().to_string());
    }
  }

  Some(Indicator {
    source: FeedSource::FeodoTracker,
    kind: IndicatorType::IpDstPort,
    value: format!("{}|{}", row.dst_ip, row.dst_port),
    first_seen,
    last_seen: Some(last_seen),
    status: IndicatorStatus::Unknown,
    to_ids: false,
    tags,
    comment: "Feodo tracker DST IP/port".to_string(),
    panel: None,
  })
}

/// LastOnline is date-only, taken as UTC midnight; that can land before the
/// intraday Firstseen, in which case last_seen is forced to first_seen + 1s.
/// An absent LastOnline falls back to first_seen + 1s directly, keeping
/// last_seen strictly greater than first_seen.
fn derive_last_seen(first_seen: DateTime<Utc>, last_online: Option<&str>) -> DateTime<Utc> {
  let fallback = first_seen + Duration::seconds(1);
  match last_online.and_then(super::parse_feed_date) {
    Some(last) if last >= first_seen => last,
    Some(_) => fallback,
    None => fallback,
  }
}
