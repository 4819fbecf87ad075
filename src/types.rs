use chrono::{DateTime, Utc};

/// Feed providers this importer knows about. The variant carries the
/// per-source behavior (source tag, event naming) so nothing downstream
/// branches on source-name strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeedSource {
  UrlHaus,
  FeodoTracker,
  AzorultTracker,
}

impl FeedSource {
  /// Tag attached to every attribute imported from this source. Doubles as
  /// the search key when fetching the known set.
  pub fn source_tag(&self) -> &'static str {
    match self {
      FeedSource::UrlHaus => "URLhaus",
      FeedSource::FeodoTracker => "FeodoTracker",
      FeedSource::AzorultTracker => "AzorultTracker",
    }
  }

  /// Title of the platform event holding one bucket of this source.
  pub fn event_title(&self, bucket_id: &str) -> String {
    match self {
      FeedSource::UrlHaus => format!("URLHaus import day {bucket_id}"),
      FeedSource::FeodoTracker => format!("FeodoTracker import day {bucket_id}"),
      FeedSource::AzorultTracker => format!("AzorultTracker import panel {bucket_id}"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorType {
  Url,
  IpDstPort,
  Domain,
  IpDst,
}

impl IndicatorType {
  pub fn misp_type(&self) -> &'static str {
    match self {
      IndicatorType::Url => "url",
      IndicatorType::IpDstPort => "ip-dst|port",
      IndicatorType::Domain => "domain",
      IndicatorType::IpDst => "ip-dst",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorStatus {
  Online,
  Offline,
  Unknown,
}

impl IndicatorStatus {
  pub fn parse(raw: &str) -> Self {
    match raw.trim() {
      "online" => IndicatorStatus::Online,
      "offline" => IndicatorStatus::Offline,
      _ => IndicatorStatus::Unknown,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      IndicatorStatus::Online => "online",
      IndicatorStatus::Offline => "offline",
      IndicatorStatus::Unknown => "unknown",
    }
  }
}

/// Canonical normalized feed record. Built once by a normalizer and treated
/// as immutable afterwards, except that reconciliation may bump `last_seen`
/// while merging mutations into a bucket.
#[derive(Debug, Clone)]
pub struct Indicator {
  pub source: FeedSource,
  pub kind: IndicatorType,
  pub value: String,
  pub first_seen: DateTime<Utc>,
  pub last_seen: Option<DateTime<Utc>>,
  pub status: IndicatorStatus,
  pub to_ids: bool,
  pub tags: Vec<String>,
  pub comment: String,
  /// Panel index this indicator belongs to, for panel-bucketed sources.
  pub panel: Option<String>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn event_titles_follow_source_convention() {
    assert_eq!(
      FeedSource::UrlHaus.event_title("2021-03-03"),
      "URLHaus import day 2021-03-03"
    );
    assert_eq!(
      FeedSource::FeodoTracker.event_title("2020-05-01"),
      "FeodoTracker import day 2020-05-01"
    );
    assert_eq!(
      FeedSource::AzorultTracker.event_title("http://panel.example/index.php"),
      "AzorultTracker import panel http://panel.example/index.php"
    );
  }

  #[test]
  fn status_parse_is_lenient() {
    assert_eq!(IndicatorStatus::parse("online"), IndicatorStatus::Online);
    assert_eq!(IndicatorStatus::parse(" offline "), IndicatorStatus::Offline);
    assert_eq!(IndicatorStatus::parse(""), IndicatorStatus::Unknown);
    assert_eq!(IndicatorStatus::parse("weird"), IndicatorStatus::Unknown);
  }
}
