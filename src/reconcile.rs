use crate::bucket::{self, BucketKey};
use crate::misp::{Attribute, AttributeRef, PlatformGateway};
use crate::types::{FeedSource, Indicator, IndicatorStatus};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};

/// One attribute already present platform-side, reduced to what
/// classification needs.
#[derive(Debug, Clone)]
pub struct KnownAttribute {
  pub id: String,
  pub event_id: String,
  pub value: String,
  pub last_seen: Option<DateTime<Utc>>,
  pub status: IndicatorStatus,
}

/// All attributes tagged with one source, fetched once per run.
#[derive(Debug, Default)]
pub struct KnownSet {
  by_value: HashMap<String, Vec<KnownAttribute>>,
  bare_ips: HashSet<String>,
}

impl KnownSet {
  pub fn from_refs(refs: &[AttributeRef]) -> Self {
    let mut set = Self::default();
    for r in refs {
      let status = status_from_tags(&r.tags);
      if let Some((ip, _port)) = r.value.split_once('|') {
        set.bare_ips.insert(ip.to_string());
      }
      set
        .by_value
        .entry(r.value.clone())
        .or_default()
        .push(KnownAttribute {
          id: r.id.clone(),
          event_id: r.event_id.clone(),
          value: r.value.clone(),
          last_seen: r.last_seen,
          status,
        });
    }
    set
  }

  fn matches(&self, value: &str) -> &[KnownAttribute] {
    self.by_value.get(value).map(Vec::as_slice).unwrap_or(&[])
  }

  fn has_bare_ip(&self, ip: &str) -> bool {
    self.bare_ips.contains(ip)
  }

  pub fn len(&self) -> usize {
    self.by_value.values().map(Vec::len).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.by_value.is_empty()
  }
}

fn status_from_tags(tags: &[String]) -> IndicatorStatus {
  if tags.iter().any(|t| t == "online") {
    IndicatorStatus::Online
  } else if tags.iter().any(|t| t == "offline") {
    IndicatorStatus::Offline
  } else {
    IndicatorStatus::Unknown
  }
}

/// A single platform change. Event creation and publishing are per-bucket
/// steps, not mutations of their own.
#[derive(Debug, Clone)]
pub enum Mutation {
  Add(Indicator),
  UpdateLastSeen {
    value: String,
    last_seen: DateTime<Utc>,
  },
  Delete {
    value: String,
  },
}

#[derive(Debug)]
pub struct BucketPlan {
  pub date: NaiveDate,
  pub mutations: Vec<Mutation>,
  /// Soft-delete every attribute already on the event before applying the
  /// mutations. Set when a panel's status flips: the whole fan-out set is
  /// re-added, including values the feed no longer lists.
  pub clear_existing: bool,
}

/// All mutations of one run, grouped per bucket. Buckets apply
/// independently; iteration order is deterministic.
#[derive(Debug, Default)]
pub struct Plan {
  pub buckets: BTreeMap<BucketKey, BucketPlan>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
  New,
  Unchanged,
  Flip,
  Refresh(DateTime<Utc>),
  Ambiguous,
}

/// Classifies every indicator against the known set and groups the resulting
/// mutations per bucket. Pure planning; nothing touches the platform here.
pub fn plan(indicators: Vec<Indicator>, known: &KnownSet) -> Plan {
  let mut plan = Plan::default();
  let mut skipped = 0usize;

  // A panel status flip invalidates the whole panel event, not just the
  // flipped value: platform tags cannot be edited in place, and attributes
  // the feed dropped from the record must not survive under the old status.
  // Find those buckets first so unchanged siblings still get re-added.
  let flipped_panels: HashSet<BucketKey> = indicators
    .iter()
    .filter(|i| i.source == FeedSource::AzorultTracker)
    .filter(|i| classify(i, known) == Outcome::Flip)
    .map(|i| bucket::key_for(i))
    .collect();
  for key in &flipped_panels {
    tracing::info!(
      bucket = %key.event_title(),
      "panel status flip; clearing event and re-adding the fan-out set"
    );
  }

  for indicator in indicators {
    if indicator.source == FeedSource::AzorultTracker
      && flipped_panels.contains(&bucket::key_for(&indicator))
    {
      plan.push_cleared_add(indicator);
      continue;
    }
    match classify(&indicator, known) {
      Outcome::New => plan.push_add(indicator),
      Outcome::Unchanged => skipped += 1,
      Outcome::Flip => {
        tracing::info!(
          value = %indicator.value,
          status = indicator.status.as_str(),
          "status flip; replacing attribute"
        );
        plan.push_replace(indicator);
      }
      Outcome::Refresh(last_seen) => plan.push_refresh(&indicator, last_seen),
      Outcome::Ambiguous => {
        let colliding: Vec<String> = known
          .matches(&indicator.value)
          .iter()
          .map(|k| format!("event {} attribute {}", k.event_id, k.id))
          .collect();
        tracing::warn!(
          value = %indicator.value,
          matches = ?colliding,
          "multiple known attributes match one value; skipping"
        );
      }
    }
  }

  if skipped > 0 {
    tracing::debug!(skipped, "indicators already known and unchanged");
  }
  plan
}

fn classify(indicator: &Indicator, known: &KnownSet) -> Outcome {
  let matches = known.matches(&indicator.value);

  if matches.is_empty() {
    // The composite ip|port is the canonical match key. A known attribute
    // sharing the bare IP under a different port is a feed discrepancy
    // worth surfacing, but the composite still counts as new.
    if indicator.source == FeedSource::FeodoTracker {
      if let Some((ip, _)) = indicator.value.split_once('|') {
        if known.has_bare_ip(ip) {
          tracing::warn!(
            value = %indicator.value,
            ip = %ip,
            "known attribute shares this IP under another port; importing composite as new"
          );
        }
      }
    }
    return Outcome::New;
  }

  if matches.len() > 1 {
    return Outcome::Ambiguous;
  }

  let existing = &matches[0];
  if existing.status != IndicatorStatus::Unknown
    && indicator.status != IndicatorStatus::Unknown
    && existing.status != indicator.status
  {
    return Outcome::Flip;
  }

  if indicator.source == FeedSource::FeodoTracker {
    if let Some(candidate) = indicator.last_seen {
      match existing.last_seen {
        None => return Outcome::Refresh(candidate),
        Some(current) if candidate > current => return Outcome::Refresh(candidate),
        Some(_) => {}
      }
    }
  }

  Outcome::Unchanged
}

impl Plan {
  fn bucket_for(&mut self, indicator: &Indicator) -> &mut BucketPlan {
    let key = bucket::key_for(indicator);
    self.buckets.entry(key).or_insert_with(|| BucketPlan {
      date: indicator.first_seen.date_naive(),
      mutations: Vec::new(),
      clear_existing: false,
    })
  }

  fn push_add(&mut self, indicator: Indicator) {
    let bucket = self.bucket_for(&indicator);
    let duplicate = bucket.mutations.iter().any(|m| match m {
      Mutation::Add(pending) => pending.value == indicator.value,
      _ => false,
    });
    if duplicate {
      tracing::debug!(value = %indicator.value, "duplicate feed row within bucket; skipping");
      return;
    }
    bucket.mutations.push(Mutation::Add(indicator));
  }

  fn push_cleared_add(&mut self, indicator: Indicator) {
    self.bucket_for(&indicator).clear_existing = true;
    self.push_add(indicator);
  }

  fn push_replace(&mut self, indicator: Indicator) {
    let bucket = self.bucket_for(&indicator);
    bucket.mutations.push(Mutation::Delete {
      value: indicator.value.clone(),
    });
    bucket.mutations.push(Mutation::Add(indicator));
  }

  fn push_refresh(&mut self, indicator: &Indicator, last_seen: DateTime<Utc>) {
    let bucket = self.bucket_for(indicator);
    // Value-based merge: if this run already adds the value, bump that
    // pending attribute instead of queueing a second mutation.
    for m in bucket.mutations.iter_mut() {
      if let Mutation::Add(pending) = m {
        if pending.value == indicator.value {
          pending.last_seen = Some(last_seen);
          return;
        }
      }
    }
    bucket.mutations.push(Mutation::UpdateLastSeen {
      value: indicator.value.clone(),
      last_seen,
    });
  }

  pub fn is_empty(&self) -> bool {
    self.buckets.is_empty()
  }

  pub fn mutation_count(&self) -> usize {
    self.buckets.values().map(|b| b.mutations.len()).sum()
  }
}

#[derive(Debug, Default)]
pub struct ApplySummary {
  pub buckets_applied: usize,
  pub buckets_failed: usize,
  pub mutations_applied: usize,
}

/// Applies the plan bucket by bucket: one update-or-create plus one publish
/// call per bucket. A failing bucket is logged with its identity and the
/// values involved and does not block the others; its changes are re-derived
/// on the next scheduled run.
pub fn apply(plan: &Plan, gateway: &mut dyn PlatformGateway) -> ApplySummary {
  let mut summary = ApplySummary::default();

  for (key, bucket_plan) in &plan.buckets {
    match apply_bucket(key, bucket_plan, gateway) {
      Ok(applied) => {
        summary.buckets_applied += 1;
        summary.mutations_applied += applied;
        tracing::info!(
          bucket = %key.event_title(),
          mutations = applied,
          "bucket applied"
        );
      }
      Err(e) => {
        summary.buckets_failed += 1;
        tracing::error!(
          bucket = %key.event_title(),
          values = ?bucket_values(bucket_plan),
          error = %format!("{e:#}"),
          "bucket import failed"
        );
      }
    }
  }

  summary
}

fn apply_bucket(
  key: &BucketKey,
  bucket_plan: &BucketPlan,
  gateway: &mut dyn PlatformGateway,
) -> anyhow::Result<usize> {
  let mut event = match gateway.find_event(key)? {
    Some(event) => event,
    None => gateway.create_event(key, bucket_plan.date)?,
  };

  if bucket_plan.clear_existing {
    for attr in event.attributes.iter_mut() {
      attr.deleted = true;
    }
  }

  for mutation in &bucket_plan.mutations {
    match mutation {
      Mutation::Add(indicator) => {
        for tag in &indicator.tags {
          if let Err(e) = gateway.ensure_tag(tag) {
            tracing::warn!(tag = %tag, error = %format!("{e:#}"), "could not ensure tag exists");
          }
        }
        event.attributes.push(Attribute::from_indicator(indicator));
      }
      Mutation::UpdateLastSeen { value, last_seen } => {
        match event
          .attributes
          .iter_mut()
          .find(|a| !a.deleted && a.value == *value)
        {
          Some(attr) => attr.set_last_seen(*last_seen),
          None => tracing::warn!(
            value = %value,
            bucket = %key.event_title(),
            "last_seen refresh targets an attribute missing from the event"
          ),
        }
      }
      Mutation::Delete { value } => {
        for attr in event.attributes.iter_mut().filter(|a| a.value == *value) {
          attr.deleted = true;
        }
      }
    }
  }

  gateway.update_event(&event)?;
  let id = event
    .id
    .as_deref()
    .ok_or_else(|| anyhow::anyhow!("event has no id after create/update"))?;
  gateway.publish(id)?;
  Ok(bucket_plan.mutations.len())
}

fn bucket_values(bucket_plan: &BucketPlan) -> Vec<&str> {
  bucket_plan
    .mutations
    .iter()
    .map(|m| match m {
      Mutation::Add(i) => i.value.as_str(),
      Mutation::UpdateLastSeen { value, .. } => value.as_str(),
      Mutation::Delete { value } => value.as_str(),
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::misp::Event;
  use crate::types::IndicatorType;
  use chrono::TimeZone;
  use std::collections::HashMap;

  fn url_indicator(value: &str, day: (i32, u32, u32), status: IndicatorStatus) -> Indicator {
    let status_tag = status.as_str().to_string();
    Indicator {
      source: FeedSource::UrlHaus,
      kind: IndicatorType::Url,
      value: value.to_string(),
      first_seen: Utc
        .with_ymd_and_hms(day.0, day.1, day.2, 12, 0, 0)
        .unwrap(),
      last_seen: None,
      status,
      to_ids: status == IndicatorStatus::Online,
      tags: vec!["URLhaus".to_string(), status_tag],
      comment: String::new(),
      panel: None,
    }
  }

  fn feodo_indicator(value: &str, last_seen: Option<DateTime<Utc>>) -> Indicator {
    Indicator {
      source: FeedSource::FeodoTracker,
      kind: IndicatorType::IpDstPort,
      value: value.to_string(),
      first_seen: Utc.with_ymd_and_hms(2020, 5, 1, 10, 0, 0).unwrap(),
      last_seen,
      status: IndicatorStatus::Unknown,
      to_ids: false,
      tags: vec!["FeodoTracker".to_string(), "Emotet".to_string()],
      comment: "Feodo tracker DST IP/port".to_string(),
      panel: None,
    }
  }

  fn azorult_indicator(kind: IndicatorType, value: &str, status: IndicatorStatus) -> Indicator {
    Indicator {
      source: FeedSource::AzorultTracker,
      kind,
      value: value.to_string(),
      first_seen: Utc.with_ymd_and_hms(2020, 6, 9, 16, 0, 0).unwrap(),
      last_seen: None,
      status,
      to_ids: false,
      tags: vec![
        "AzorultTracker".to_string(),
        "3.4.1".to_string(),
        "feeder_one".to_string(),
        status.as_str().to_string(),
      ],
      comment: String::new(),
      panel: Some("http://panel.example/index.php".to_string()),
    }
  }

  fn known(entries: &[(&str, Option<DateTime<Utc>>, &str)]) -> KnownSet {
    let refs: Vec<AttributeRef> = entries
      .iter()
      .map(|(value, last_seen, status)| AttributeRef {
        id: "1".to_string(),
        event_id: "1".to_string(),
        value: value.to_string(),
        last_seen: *last_seen,
        tags: vec!["URLhaus".to_string(), status.to_string()],
      })
      .collect();
    KnownSet::from_refs(&refs)
  }

  /// In-memory stand-in for the platform, good enough to observe the
  /// per-bucket call pattern.
  #[derive(Default)]
  struct FakeGateway {
    events: HashMap<String, Event>,
    next_id: u64,
    created: Vec<String>,
    updated: Vec<String>,
    published: Vec<String>,
    ensured_tags: Vec<String>,
    fail_bucket: Option<String>,
  }

  impl FakeGateway {
    fn event_by_title(&self, title: &str) -> Option<&Event> {
      self.events.get(title)
    }
  }

  impl PlatformGateway for FakeGateway {
    fn find_event(&mut self, key: &BucketKey) -> anyhow::Result<Option<Event>> {
      Ok(self.events.get(&key.event_title()).cloned())
    }

    fn create_event(&mut self, key: &BucketKey, date: NaiveDate) -> anyhow::Result<Event> {
      self.next_id += 1;
      let event = Event {
        id: Some(self.next_id.to_string()),
        info: key.event_title(),
        date,
        attributes: Vec::new(),
      };
      self.created.push(event.info.clone());
      self.events.insert(event.info.clone(), event.clone());
      Ok(event)
    }

    fn find_attributes(&mut self, source_tag: &str) -> anyhow::Result<Vec<AttributeRef>> {
      let mut out = Vec::new();
      for event in self.events.values() {
        for attr in &event.attributes {
          if attr.deleted || !attr.tag_names().any(|t| t == source_tag) {
            continue;
          }
          out.push(AttributeRef {
            id: attr.id.clone().unwrap_or_default(),
            event_id: event.id.clone().unwrap_or_default(),
            value: attr.value.clone(),
            last_seen: attr.last_seen.as_deref().and_then(crate::misp::parse_ts),
            tags: attr.tag_names().map(String::from).collect(),
          });
        }
      }
      Ok(out)
    }

    fn update_event(&mut self, event: &Event) -> anyhow::Result<()> {
      if self.fail_bucket.as_deref() == Some(event.info.as_str()) {
        anyhow::bail!("simulated platform rejection");
      }
      self.updated.push(event.info.clone());
      self.events.insert(event.info.clone(), event.clone());
      Ok(())
    }

    fn publish(&mut self, event_id: &str) -> anyhow::Result<()> {
      self.published.push(event_id.to_string());
      Ok(())
    }

    fn ensure_tag(&mut self, name: &str) -> anyhow::Result<()> {
      self.ensured_tags.push(name.to_string());
      Ok(())
    }
  }

  #[test]
  fn unchanged_known_indicators_emit_no_mutations() {
    let known = known(&[("http://evil.example/a", None, "online")]);
    let plan = plan(
      vec![url_indicator(
        "http://evil.example/a",
        (2021, 3, 3),
        IndicatorStatus::Online,
      )],
      &known,
    );
    assert!(plan.is_empty());
  }

  #[test]
  fn unknown_value_becomes_add() {
    let plan = plan(
      vec![url_indicator(
        "http://evil.example/a",
        (2021, 3, 3),
        IndicatorStatus::Online,
      )],
      &KnownSet::default(),
    );
    assert_eq!(plan.mutation_count(), 1);
    let bucket = plan.buckets.values().next().unwrap();
    assert!(matches!(bucket.mutations[0], Mutation::Add(_)));
  }

  #[test]
  fn status_flip_is_delete_then_add_within_one_bucket() {
    let known = known(&[("http://evil.example/a", None, "online")]);
    let plan = plan(
      vec![url_indicator(
        "http://evil.example/a",
        (2021, 3, 3),
        IndicatorStatus::Offline,
      )],
      &known,
    );

    assert_eq!(plan.buckets.len(), 1);
    let (key, bucket) = plan.buckets.iter().next().unwrap();
    assert_eq!(key.id, "2021-03-03");
    assert_eq!(bucket.mutations.len(), 2);
    assert!(matches!(&bucket.mutations[0], Mutation::Delete { value } if value == "http://evil.example/a"));
    match &bucket.mutations[1] {
      Mutation::Add(ind) => {
        assert_eq!(ind.status, IndicatorStatus::Offline);
        assert!(ind.tags.iter().any(|t| t == "offline"));
      }
      other => panic!("expected Add, got {other:?}"),
    }
  }

  #[test]
  fn offline_to_online_flip_also_replaces() {
    let known = known(&[("http://evil.example/a", None, "offline")]);
    let plan = plan(
      vec![url_indicator(
        "http://evil.example/a",
        (2021, 3, 3),
        IndicatorStatus::Online,
      )],
      &known,
    );
    assert_eq!(plan.mutation_count(), 2);
  }

  #[test]
  fn unknown_feed_status_never_flips() {
    let known = known(&[("1.2.3.4|443", None, "online")]);
    // Feodo indicators carry Unknown status; a definite platform status must
    // not be flipped by an indefinite feed one.
    let plan = plan(vec![feodo_indicator("1.2.3.4|443", None)], &known);
    assert!(plan.is_empty());
  }

  #[test]
  fn newer_last_seen_becomes_refresh() {
    let old = Utc.with_ymd_and_hms(2020, 5, 2, 0, 0, 0).unwrap();
    let newer = Utc.with_ymd_and_hms(2020, 5, 4, 0, 0, 0).unwrap();
    let known = known(&[("1.2.3.4|443", Some(old), "unknown")]);

    let plan = plan(vec![feodo_indicator("1.2.3.4|443", Some(newer))], &known);
    assert_eq!(plan.mutation_count(), 1);
    let bucket = plan.buckets.values().next().unwrap();
    assert!(
      matches!(&bucket.mutations[0], Mutation::UpdateLastSeen { value, last_seen }
        if value == "1.2.3.4|443" && *last_seen == newer)
    );
  }

  #[test]
  fn older_last_seen_is_skipped() {
    let current = Utc.with_ymd_and_hms(2020, 5, 4, 0, 0, 0).unwrap();
    let older = Utc.with_ymd_and_hms(2020, 5, 2, 0, 0, 0).unwrap();
    let known = known(&[("1.2.3.4|443", Some(current), "unknown")]);
    let plan = plan(vec![feodo_indicator("1.2.3.4|443", Some(older))], &known);
    assert!(plan.is_empty());
  }

  #[test]
  fn missing_platform_last_seen_is_backfilled() {
    let candidate = Utc.with_ymd_and_hms(2020, 5, 4, 0, 0, 0).unwrap();
    let known = known(&[("1.2.3.4|443", None, "unknown")]);
    let plan = plan(vec![feodo_indicator("1.2.3.4|443", Some(candidate))], &known);
    assert_eq!(plan.mutation_count(), 1);
  }

  #[test]
  fn refresh_merges_into_pending_add_for_same_value() {
    // Same composite appears twice in one feed file: first unknown (Add),
    // then... the dedup keeps one Add; an explicit refresh folds into it.
    let newer = Utc.with_ymd_and_hms(2020, 5, 4, 0, 0, 0).unwrap();
    let mut plan = Plan::default();
    let ind = feodo_indicator("1.2.3.4|443", None);
    plan.push_add(ind.clone());
    plan.push_refresh(&ind, newer);

    assert_eq!(plan.mutation_count(), 1);
    let bucket = plan.buckets.values().next().unwrap();
    match &bucket.mutations[0] {
      Mutation::Add(pending) => assert_eq!(pending.last_seen, Some(newer)),
      other => panic!("expected merged Add, got {other:?}"),
    }
  }

  #[test]
  fn ambiguous_value_is_skipped_with_no_mutation() {
    let refs = vec![
      AttributeRef {
        id: "1".to_string(),
        event_id: "1".to_string(),
        value: "http://evil.example/a".to_string(),
        last_seen: None,
        tags: vec!["URLhaus".to_string(), "online".to_string()],
      },
      AttributeRef {
        id: "2".to_string(),
        event_id: "2".to_string(),
        value: "http://evil.example/a".to_string(),
        last_seen: None,
        tags: vec!["URLhaus".to_string()],
      },
    ];
    let known = KnownSet::from_refs(&refs);
    let plan = plan(
      vec![url_indicator(
        "http://evil.example/a",
        (2021, 3, 3),
        IndicatorStatus::Offline,
      )],
      &known,
    );
    assert!(plan.is_empty());
  }

  #[test]
  fn two_rows_one_day_share_one_event_and_one_publish() {
    let plan = plan(
      vec![
        url_indicator("http://evil.example/a", (2021, 3, 3), IndicatorStatus::Online),
        url_indicator("http://evil.example/b", (2021, 3, 3), IndicatorStatus::Online),
      ],
      &KnownSet::default(),
    );
    assert_eq!(plan.buckets.len(), 1);
    assert_eq!(plan.mutation_count(), 2);

    let mut gateway = FakeGateway::default();
    let summary = apply(&plan, &mut gateway);

    assert_eq!(summary.buckets_applied, 1);
    assert_eq!(summary.mutations_applied, 2);
    assert_eq!(gateway.created, vec!["URLHaus import day 2021-03-03"]);
    assert_eq!(gateway.published.len(), 1);
    let event = gateway.event_by_title("URLHaus import day 2021-03-03").unwrap();
    assert_eq!(event.attributes.len(), 2);
  }

  #[test]
  fn second_run_with_same_feed_is_idempotent() {
    let indicators = vec![
      url_indicator("http://evil.example/a", (2021, 3, 3), IndicatorStatus::Online),
      url_indicator("http://evil.example/b", (2021, 3, 4), IndicatorStatus::Offline),
    ];

    let mut gateway = FakeGateway::default();
    let first = plan(indicators.clone(), &KnownSet::default());
    assert_eq!(first.mutation_count(), 2);
    apply(&first, &mut gateway);

    // Re-fetch the known set from platform state, exactly as a new run would.
    let refs = gateway.find_attributes("URLhaus").unwrap();
    let known = KnownSet::from_refs(&refs);
    let second = plan(indicators, &known);
    assert!(second.is_empty());
  }

  #[test]
  fn failed_bucket_does_not_block_others() {
    let plan = plan(
      vec![
        url_indicator("http://evil.example/a", (2021, 3, 3), IndicatorStatus::Online),
        url_indicator("http://evil.example/b", (2021, 3, 4), IndicatorStatus::Online),
      ],
      &KnownSet::default(),
    );
    assert_eq!(plan.buckets.len(), 2);

    let mut gateway = FakeGateway {
      fail_bucket: Some("URLHaus import day 2021-03-03".to_string()),
      ..FakeGateway::default()
    };
    let summary = apply(&plan, &mut gateway);

    assert_eq!(summary.buckets_failed, 1);
    assert_eq!(summary.buckets_applied, 1);
    assert_eq!(gateway.published.len(), 1);
  }

  #[test]
  fn delete_marks_existing_attribute_and_add_appends() {
    let known = known(&[("http://evil.example/a", None, "online")]);
    let flipped = plan(
      vec![url_indicator(
        "http://evil.example/a",
        (2021, 3, 3),
        IndicatorStatus::Offline,
      )],
      &known,
    );

    // Seed the gateway with the bucket event holding the online attribute.
    let mut gateway = FakeGateway::default();
    let key = BucketKey {
      source: FeedSource::UrlHaus,
      id: "2021-03-03".to_string(),
    };
    let mut event = gateway
      .create_event(&key, NaiveDate::from_ymd_opt(2021, 3, 3).unwrap())
      .unwrap();
    event.attributes.push(Attribute::from_indicator(&url_indicator(
      "http://evil.example/a",
      (2021, 3, 3),
      IndicatorStatus::Online,
    )));
    gateway.update_event(&event).unwrap();

    apply(&flipped, &mut gateway);

    let event = gateway.event_by_title("URLHaus import day 2021-03-03").unwrap();
    assert_eq!(event.attributes.len(), 2);
    assert!(event.attributes[0].deleted);
    assert!(!event.attributes[1].deleted);
    assert!(event.attributes[1].tag_names().any(|t| t == "offline"));
    // Tags of the replacement attribute were ensured before the add.
    assert!(gateway.ensured_tags.iter().any(|t| t == "offline"));
  }

  #[test]
  fn panel_flip_clears_bucket_and_readds_full_fan_out() {
    // Platform knows the panel url and a domain, both online. The feed now
    // reports the panel offline and no longer lists that domain.
    let refs = vec![
      AttributeRef {
        id: "10".to_string(),
        event_id: "5".to_string(),
        value: "http://panel.example/index.php".to_string(),
        last_seen: None,
        tags: vec!["AzorultTracker".to_string(), "online".to_string()],
      },
      AttributeRef {
        id: "11".to_string(),
        event_id: "5".to_string(),
        value: "old.domain".to_string(),
        last_seen: None,
        tags: vec!["AzorultTracker".to_string(), "online".to_string()],
      },
    ];
    let known = KnownSet::from_refs(&refs);

    // The ip precedes the flipped url in feed order; it must still become a
    // cleared add rather than a plain new one.
    let plan = plan(
      vec![
        azorult_indicator(IndicatorType::IpDst, "198.51.100.7", IndicatorStatus::Offline),
        azorult_indicator(
          IndicatorType::Url,
          "http://panel.example/index.php",
          IndicatorStatus::Offline,
        ),
      ],
      &known,
    );

    assert_eq!(plan.buckets.len(), 1);
    let bucket = plan.buckets.values().next().unwrap();
    assert!(bucket.clear_existing);
    assert_eq!(bucket.mutations.len(), 2);
    assert!(bucket
      .mutations
      .iter()
      .all(|m| matches!(m, Mutation::Add(_))));
  }

  #[test]
  fn panel_flip_soft_deletes_attributes_the_feed_dropped() {
    // Seed the panel event with an online url plus a domain that the next
    // feed run no longer vouches for.
    let mut gateway = FakeGateway::default();
    let key = BucketKey {
      source: FeedSource::AzorultTracker,
      id: "http://panel.example/index.php".to_string(),
    };
    let mut event = gateway
      .create_event(&key, NaiveDate::from_ymd_opt(2020, 6, 9).unwrap())
      .unwrap();
    event.attributes.push(Attribute::from_indicator(&azorult_indicator(
      IndicatorType::Url,
      "http://panel.example/index.php",
      IndicatorStatus::Online,
    )));
    event.attributes.push(Attribute::from_indicator(&azorult_indicator(
      IndicatorType::Domain,
      "old.domain",
      IndicatorStatus::Online,
    )));
    gateway.update_event(&event).unwrap();

    let refs = gateway.find_attributes("AzorultTracker").unwrap();
    let known = KnownSet::from_refs(&refs);
    let flipped = plan(
      vec![
        azorult_indicator(
          IndicatorType::Url,
          "http://panel.example/index.php",
          IndicatorStatus::Offline,
        ),
        azorult_indicator(IndicatorType::IpDst, "198.51.100.7", IndicatorStatus::Offline),
      ],
      &known,
    );
    let summary = apply(&flipped, &mut gateway);
    assert_eq!(summary.buckets_applied, 1);

    let event = gateway
      .event_by_title("AzorultTracker import panel http://panel.example/index.php")
      .unwrap();
    let stale = event
      .attributes
      .iter()
      .find(|a| a.value == "old.domain")
      .unwrap();
    assert!(stale.deleted);

    let live: Vec<&Attribute> = event.attributes.iter().filter(|a| !a.deleted).collect();
    assert_eq!(live.len(), 2);
    assert!(live.iter().all(|a| a.tag_names().any(|t| t == "offline")));
    assert!(live.iter().any(|a| a.value == "198.51.100.7"));
    assert!(live.iter().any(|a| a.value == "http://panel.example/index.php"));
  }

  #[test]
  fn known_set_counts_and_ip_index() {
    let refs = vec![AttributeRef {
      id: "1".to_string(),
      event_id: "1".to_string(),
      value: "1.2.3.4|443".to_string(),
      last_seen: None,
      tags: vec!["FeodoTracker".to_string()],
    }];
    let known = KnownSet::from_refs(&refs);
    assert_eq!(known.len(), 1);
    assert!(known.has_bare_ip("1.2.3.4"));
    assert!(known.matches("1.2.3.4|8080").is_empty());
    // Platform ids ride along so skip warnings can name the collision.
    assert_eq!(known.matches("1.2.3.4|443")[0].id, "1");
    assert_eq!(known.matches("1.2.3.4|443")[0].event_id, "1");
  }
}
