use crate::bucket::BucketKey;
use crate::config::MispConfig;
use crate::types::Indicator;
use anyhow::Context;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Platform-side event aggregate for one bucket.
#[derive(Debug, Clone)]
pub struct Event {
  pub id: Option<String>,
  pub info: String,
  pub date: NaiveDate,
  pub attributes: Vec<Attribute>,
}

/// One attribute as it travels over the MISP wire. Timestamps stay strings
/// here; the reconciliation engine works with parsed copies (`AttributeRef`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attribute {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(rename = "type")]
  pub misp_type: String,
  pub value: String,
  #[serde(default)]
  pub to_ids: bool,
  #[serde(default)]
  pub comment: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub first_seen: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_seen: Option<String>,
  #[serde(default)]
  pub deleted: bool,
  #[serde(default)]
  pub disable_correlation: bool,
  #[serde(rename = "Tag", default, skip_serializing_if = "Vec::is_empty")]
  pub tags: Vec<TagRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagRef {
  pub name: String,
}

impl Attribute {
  pub fn from_indicator(indicator: &Indicator) -> Self {
    Self {
      id: None,
      misp_type: indicator.kind.misp_type().to_string(),
      value: indicator.value.clone(),
      to_ids: indicator.to_ids,
      comment: indicator.comment.clone(),
      first_seen: Some(format_ts(indicator.first_seen)),
      last_seen: indicator.last_seen.map(format_ts),
      deleted: false,
      disable_correlation: false,
      tags: indicator
        .tags
        .iter()
        .map(|t| TagRef { name: t.clone() })
        .collect(),
    }
  }

  pub fn set_last_seen(&mut self, ts: DateTime<Utc>) {
    self.last_seen = Some(format_ts(ts));
  }

  pub fn tag_names(&self) -> impl Iterator<Item = &str> {
    self.tags.iter().map(|t| t.name.as_str())
  }
}

/// Result row of an attribute search: just enough for the reconciliation
/// engine to classify incoming indicators.
#[derive(Debug, Clone)]
pub struct AttributeRef {
  pub id: String,
  pub event_id: String,
  pub value: String,
  pub last_seen: Option<DateTime<Utc>>,
  pub tags: Vec<String>,
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
  ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(raw)
    .ok()
    .map(|d| d.with_timezone(&Utc))
}

/// Narrow interface the reconciliation engine drives. Kept synchronous; a
/// run is one single-threaded batch.
pub trait PlatformGateway {
  fn find_event(&mut self, key: &BucketKey) -> anyhow::Result<Option<Event>>;
  fn create_event(&mut self, key: &BucketKey, date: NaiveDate) -> anyhow::Result<Event>;
  fn find_attributes(&mut self, source_tag: &str) -> anyhow::Result<Vec<AttributeRef>>;
  fn update_event(&mut self, event: &Event) -> anyhow::Result<()>;
  fn publish(&mut self, event_id: &str) -> anyhow::Result<()>;
  /// Idempotent; tag creation racing a concurrent create only costs a
  /// redundant call, never data loss.
  fn ensure_tag(&mut self, name: &str) -> anyhow::Result<()>;
}

/// Process-wide append-only cache of tag names known to exist platform-side.
/// Stale reads cause at most a redundant create-tag call.
#[derive(Debug, Default)]
pub struct TagCache {
  names: HashSet<String>,
  loaded: bool,
}

impl TagCache {
  pub fn contains(&self, name: &str) -> bool {
    self.names.contains(name)
  }

  pub fn insert(&mut self, name: &str) {
    self.names.insert(name.to_string());
  }

  pub fn is_loaded(&self) -> bool {
    self.loaded
  }

  pub fn replace(&mut self, names: impl IntoIterator<Item = String>) {
    // Append-only: a refresh never drops names we already saw.
    self.names.extend(names);
    self.loaded = true;
  }
}

pub struct MispGateway {
  client: Client,
  base: Url,
  auth_key: String,
  tag_cache: TagCache,
}

impl MispGateway {
  pub fn new(cfg: &MispConfig) -> anyhow::Result<Self> {
    let mut raw = cfg.url.clone();
    if !raw.ends_with('/') {
      raw.push('/');
    }
    let base = Url::parse(&raw).with_context(|| format!("invalid MISP URL: {}", cfg.url))?;

    let client = Client::builder()
      .timeout(Duration::from_secs(cfg.timeout_seconds))
      .build()
      .context("build MISP HTTP client")?;

    Ok(Self {
      client,
      base,
      auth_key: cfg.auth_key.clone(),
      tag_cache: TagCache::default(),
    })
  }

  fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> anyhow::Result<T> {
    let url = self
      .base
      .join(path)
      .with_context(|| format!("build MISP URL for {path}"))?;
    let response = self
      .client
      .post(url)
      .header(AUTHORIZATION, &self.auth_key)
      .header(ACCEPT, "application/json")
      .header(CONTENT_TYPE, "application/json")
      .body(serde_json::to_string(body)?)
      .send()
      .with_context(|| format!("POST {path}"))?;

    let status = response.status();
    let text = response.text().with_context(|| format!("read response for {path}"))?;
    if !status.is_success() {
      anyhow::bail!("MISP returned HTTP {} for {path}: {}", status.as_u16(), truncate(&text));
    }
    serde_json::from_str(&text).with_context(|| format!("parse response for {path}"))
  }

  fn get<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
    let url = self
      .base
      .join(path)
      .with_context(|| format!("build MISP URL for {path}"))?;
    let response = self
      .client
      .get(url)
      .header(AUTHORIZATION, &self.auth_key)
      .header(ACCEPT, "application/json")
      .send()
      .with_context(|| format!("GET {path}"))?;

    let status = response.status();
    let text = response.text().with_context(|| format!("read response for {path}"))?;
    if !status.is_success() {
      anyhow::bail!("MISP returned HTTP {} for {path}: {}", status.as_u16(), truncate(&text));
    }
    serde_json::from_str(&text).with_context(|| format!("parse response for {path}"))
  }

  fn refresh_tag_cache(&mut self) -> anyhow::Result<()> {
    let listed: TagListResponse = self.get("tags")?;
    self
      .tag_cache
      .replace(listed.tags.into_iter().map(|t| t.name));
    Ok(())
  }
}

impl PlatformGateway for MispGateway {
  fn find_event(&mut self, key: &BucketKey) -> anyhow::Result<Option<Event>> {
    let title = key.event_title();
    let found: EventSearchResponse = self.post(
      "events/restSearch",
      &serde_json::json!({ "eventinfo": title }),
    )?;

    // restSearch matches substrings; insist on the exact title.
    let mut hits = found
      .response
      .into_iter()
      .filter(|w| w.event.info == title);
    let Some(first) = hits.next() else {
      return Ok(None);
    };
    if hits.next().is_some() {
      tracing::warn!(title = %title, "multiple events share a bucket title; using the first");
    }
    Ok(Some(first.event.into_event()?))
  }

  fn create_event(&mut self, key: &BucketKey, date: NaiveDate) -> anyhow::Result<Event> {
    let title = key.event_title();
    // Search-before-create: event creation is the one call that is not
    // idempotent on retry.
    if let Some(existing) = self.find_event(key)? {
      return Ok(existing);
    }

    tracing::info!(title = %title, "creating platform event");
    let created: EventWrapper = self.post(
      "events/add",
      &serde_json::json!({
        "info": title,
        "date": date.to_string(),
        "published": false,
      }),
    )?;
    created.event.into_event()
  }

  fn find_attributes(&mut self, source_tag: &str) -> anyhow::Result<Vec<AttributeRef>> {
    let found: AttributeSearchResponse = self.post(
      "attributes/restSearch",
      &serde_json::json!({ "tags": [source_tag] }),
    )?;

    let mut out = Vec::new();
    for attr in found.response.attributes {
      out.push(AttributeRef {
        id: attr.id.unwrap_or_default(),
        event_id: attr.event_id.unwrap_or_default(),
        value: attr.value,
        last_seen: attr.last_seen.as_deref().and_then(parse_ts),
        tags: attr.tags.into_iter().map(|t| t.name).collect(),
      });
    }
    Ok(out)
  }

  fn update_event(&mut self, event: &Event) -> anyhow::Result<()> {
    let id = event
      .id
      .as_deref()
      .ok_or_else(|| anyhow::anyhow!("cannot update an event without an id"))?;
    let body = EventWrapper {
      event: WireEvent::from_event(event),
    };
    let _: serde_json::Value = self.post(&format!("events/edit/{id}"), &body)?;
    Ok(())
  }

  fn publish(&mut self, event_id: &str) -> anyhow::Result<()> {
    let _: serde_json::Value = self.post(
      &format!("events/publish/{event_id}"),
      &serde_json::json!({}),
    )?;
    Ok(())
  }

  fn ensure_tag(&mut self, name: &str) -> anyhow::Result<()> {
    if self.tag_cache.contains(name) {
      return Ok(());
    }
    if !self.tag_cache.is_loaded() {
      self.refresh_tag_cache()?;
      if self.tag_cache.contains(name) {
        return Ok(());
      }
    }

    tracing::debug!(tag = %name, "creating missing tag");
    let created: anyhow::Result<serde_json::Value> =
      self.post("tags/add", &serde_json::json!({ "name": name }));
    if let Err(e) = created {
      // The tag may have appeared between our check and the create call;
      // re-read before giving up.
      self.refresh_tag_cache()?;
      if !self.tag_cache.contains(name) {
        return Err(e.context(format!("create tag {name}")));
      }
      return Ok(());
    }
    self.tag_cache.insert(name);
    Ok(())
  }
}

fn truncate(text: &str) -> String {
  const MAX: usize = 200;
  if text.chars().count() <= MAX {
    return text.to_string();
  }
  let prefix: String = text.chars().take(MAX).collect();
  format!("{prefix}...")
}

// Wire shapes for the MISP REST API.

#[derive(Debug, Deserialize)]
struct EventSearchResponse {
  #[serde(default)]
  response: Vec<EventWrapper>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EventWrapper {
  #[serde(rename = "Event")]
  event: WireEvent,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireEvent {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  id: Option<String>,
  info: String,
  date: String,
  #[serde(rename = "Attribute", default)]
  attributes: Vec<Attribute>,
}

impl WireEvent {
  fn from_event(event: &Event) -> Self {
    Self {
      id: event.id.clone(),
      info: event.info.clone(),
      date: event.date.to_string(),
      attributes: event.attributes.clone(),
    }
  }

  fn into_event(self) -> anyhow::Result<Event> {
    let date = self
      .date
      .parse::<NaiveDate>()
      .with_context(|| format!("event {} has unparsable date {}", self.info, self.date))?;
    Ok(Event {
      id: self.id,
      info: self.info,
      date,
      attributes: self.attributes,
    })
  }
}

#[derive(Debug, Deserialize)]
struct AttributeSearchResponse {
  #[serde(default)]
  response: AttributeSearchInner,
}

#[derive(Debug, Default, Deserialize)]
struct AttributeSearchInner {
  #[serde(rename = "Attribute", default)]
  attributes: Vec<WireSearchAttribute>,
}

#[derive(Debug, Deserialize)]
struct WireSearchAttribute {
  #[serde(default)]
  id: Option<String>,
  #[serde(default)]
  event_id: Option<String>,
  value: String,
  #[serde(default)]
  last_seen: Option<String>,
  #[serde(rename = "Tag", default)]
  tags: Vec<TagRef>,
}

#[derive(Debug, Deserialize)]
struct TagListResponse {
  #[serde(rename = "Tag", default)]
  tags: Vec<TagRef>,
}
