use crate::types::{FeedSource, Indicator, IndicatorStatus, IndicatorType};
use chrono::NaiveDate;
use serde::Deserialize;

/// Fixed column order of the URLhaus CSV dump; the file carries no header
/// row, only `#` comments.
#[derive(Debug, Deserialize)]
struct UrlhausRow {
  #[allow(dead_code)]
  id: String,
  dateadded: String,
  url: String,
  url_status: Option<String>,
  #[allow(dead_code)]
  threat: Option<String>,
  tags: Option<String>,
  urlhaus_link: Option<String>,
  reporter: Option<String>,
}

/// Parses the URLhaus dump into indicators. Rows are newest-first; scanning
/// stops at the first row dated on or before `cutoff` (the lookback window).
/// Malformed rows are logged and skipped.
pub fn parse(text: &str, cutoff: NaiveDate) -> Vec<Indicator> {
  let mut reader = csv::ReaderBuilder::new()
    .has_headers(false)
    .comment(Some(b'#'))
    .trim(csv::Trim::All)
    .flexible(true)
    .from_reader(text.as_bytes());

  let mut out = Vec::new();
  for (line, row) in reader.deserialize::<UrlhausRow>().enumerate() {
    let row = match row {
      Ok(r) => r,
      Err(e) => {
        tracing::warn!(line, error = %e, "skipping malformed URLhaus row");
        continue;
      }
    };

    let Some(first_seen) = super::parse_feed_datetime(&row.dateadded) else {
      tracing::warn!(line, dateadded = %row.dateadded, "skipping URLhaus row with unparsable dateadded");
      continue;
    };
    if first_seen.date_naive() <= cutoff {
      tracing::debug!(day = %first_seen.date_naive(), "reached lookback cutoff; stopping URLhaus scan");
      break;
    }

    out.push(normalize(row, first_seen));
  }
  out
}

fn normalize(row: UrlhausRow, first_seen: chrono::DateTime<chrono::Utc>) -> Indicator {
  let status = row
    .url_status
    .as_deref()
    .map(IndicatorStatus::parse)
    .unwrap_or(IndicatorStatus::Unknown);

  let mut tags = vec![FeedSource::UrlHaus.source_tag().to_string()];
  if let Some(declared) = &row.tags {
    for tag in declared.split(',') {
      let tag = tag.trim();
      if !tag.is_empty() {
        tags.push(tag.to_string());
      }
    }
  }
  if status != IndicatorStatus::Unknown {
    tags.push(status.as_str().to_string());
  }
  if let Some(reporter) = &row.reporter {
    if !reporter.trim().is_empty() {
      tags.push(reporter.trim().to_string());
    }
  }

  Indicator {
    source: FeedSource::UrlHaus,
    kind: IndicatorType::Url,
    value: row.url,
    first_seen,
    last_seen: None,
    status,
    to_ids: status == IndicatorStatus::Online,
    tags,
    comment: row.urlhaus_link.unwrap_or_default(),
    panel: None,
  }
}
