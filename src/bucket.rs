use crate::types::{FeedSource, Indicator};
use chrono::{DateTime, Utc};

/// Identity of one platform event: the feed source plus either a calendar
/// day (`YYYY-MM-DD`) or a panel index. Exactly one event exists per key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey {
  pub source: FeedSource,
  pub id: String,
}

impl BucketKey {
  pub fn event_title(&self) -> String {
    self.source.event_title(&self.id)
  }
}

pub fn day_str(ts: DateTime<Utc>) -> String {
  ts.date_naive().to_string()
}

/// Maps an indicator onto its bucket. Day-based sources truncate first_seen
/// to the calendar date; the panel source buckets on the panel index itself
/// so that each distinct panel gets one event.
pub fn key_for(indicator: &Indicator) -> BucketKey {
  let id = match indicator.source {
    FeedSource::UrlHaus | FeedSource::FeodoTracker => day_str(indicator.first_seen),
    FeedSource::AzorultTracker => indicator
      .panel
      .clone()
      .unwrap_or_else(|| indicator.value.clone()),
  };
  BucketKey {
    source: indicator.source,
    id,
  }
}
