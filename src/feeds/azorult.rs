use crate::types::{FeedSource, Indicator, IndicatorStatus, IndicatorType};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct PanelRecord {
  panel_index: String,
  #[serde(default)]
  ip: Option<String>,
  #[serde(default)]
  domain: Option<String>,
  status: String,
  first_seen: i64,
  panel_version: String,
  feeder: String,
}

/// Parses the Azorult tracker JSON array. The top-level array must parse;
/// individual records are skipped with a warning when malformed.
pub fn parse(text: &str) -> anyhow::Result<Vec<Indicator>> {
  let records: Vec<serde_json::Value> =
    serde_json::from_str(text).context("parse Azorult feed JSON array")?;

  let mut out = Vec::new();
  for (index, value) in records.into_iter().enumerate() {
    let record: PanelRecord = match serde_json::from_value(value) {
      Ok(r) => r,
      Err(e) => {
        tracing::warn!(index, error = %e, "skipping malformed Azorult panel record");
        continue;
      }
    };
    match fan_out(record) {
      Ok(indicators) => out.extend(indicators),
      Err(e) => tracing::warn!(index, error = %e, "skipping Azorult panel record"),
    }
  }
  Ok(out)
}

/// One panel record fans out into up to three indicators: the panel domain,
/// the panel IP, and the panel index itself (as a URL attribute). All three
/// share the panel tags and bucket on the panel index.
fn fan_out(record: PanelRecord) -> anyhow::Result<Vec<Indicator>> {
  let first_seen = DateTime::<Utc>::from_timestamp(record.first_seen, 0)
    .ok_or_else(|| anyhow::anyhow!("first_seen epoch {} out of range", record.first_seen))?;
  let status = IndicatorStatus::parse(&record.status);

  let tags = vec![
    FeedSource::AzorultTracker.source_tag().to_string(),
    record.panel_version.clone(),
    record.feeder.clone(),
    record.status.trim().to_string(),
  ];

  let mut parts: Vec<(IndicatorType, String, &str)> = Vec::new();
  if let Some(domain) = record.domain.filter(|d| !d.trim().is_empty()) {
    parts.push((IndicatorType::Domain, domain, "domain"));
  }
  if let Some(ip) = record.ip.filter(|i| !i.trim().is_empty()) {
    parts.push((IndicatorType::IpDst, ip, "ip-dst"));
  }
  parts.push((IndicatorType::Url, record.panel_index.clone(), "url"));

  Ok(
    parts
      .into_iter()
      .map(|(kind, value, label)| Indicator {
        source: FeedSource::AzorultTracker,
        kind,
        value,
        first_seen,
        last_seen: None,
        status,
        to_ids: false,
        tags: tags.clone(),
        comment: format!("Azorult panel {label}"),
        panel: Some(record.panel_index.clone()),
      })
      .collect(),
  )
}
