use crate::config::Config;
use crate::feeds;
use crate::fetch;
use crate::misp::PlatformGateway;
use crate::reconcile::{self, KnownSet};
use crate::types::{FeedSource, Indicator};
use anyhow::Context;
use chrono::{Days, Utc};
use std::fs;

/// Runs one import for a source: reconcile the already-parsed indicators
/// against the platform's known set, then apply the plan bucket by bucket.
fn reconcile_and_apply(
  source: FeedSource,
  indicators: Vec<Indicator>,
  gateway: &mut dyn PlatformGateway,
) -> anyhow::Result<()> {
  let tag = source.source_tag();
  let refs = gateway
    .find_attributes(tag)
    .with_context(|| format!("fetch known set for {tag}"))?;
  let known = KnownSet::from_refs(&refs);
  tracing::info!(
    source = tag,
    indicators = indicators.len(),
    known = known.len(),
    "reconciling feed against platform"
  );

  let plan = reconcile::plan(indicators, &known);
  if plan.is_empty() {
    tracing::info!(source = tag, "nothing to import");
    return Ok(());
  }

  let summary = reconcile::apply(&plan, gateway);
  tracing::info!(
    source = tag,
    buckets_applied = summary.buckets_applied,
    buckets_failed = summary.buckets_failed,
    mutations = summary.mutations_applied,
    "import finished"
  );
  Ok(())
}

pub fn import_urlhaus(cfg: &Config, gateway: &mut dyn PlatformGateway) -> anyhow::Result<()> {
  if !cfg.feeds.urlhaus.enabled {
    tracing::info!("URLhaus feed disabled; skipping");
    return Ok(());
  }

  let now = Utc::now();
  let path = fetch::download_feed(&cfg.feeds.urlhaus, "urlhaus.csv", now)
    .context("download URLhaus feed")?;
  let text =
    fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;

  let cutoff = now
    .date_naive()
    .checked_sub_days(Days::new(cfg.import.lookback_days as u64))
    .unwrap_or(now.date_naive());
  tracing::debug!(cutoff = %cutoff, "URLhaus lookback cutoff");

  let indicators = feeds::urlhaus::parse(&text, cutoff);
  reconcile_and_apply(FeedSource::UrlHaus, indicators, gateway)
}

pub fn import_feodo(cfg: &Config, gateway: &mut dyn PlatformGateway) -> anyhow::Result<()> {
  if !cfg.feeds.feodo.enabled {
    tracing::info!("FeodoTracker feed disabled; skipping");
    return Ok(());
  }

  let path = fetch::download_feed(&cfg.feeds.feodo, "feodo.csv", Utc::now())
    .context("download FeodoTracker feed")?;
  let text =
    fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;

  let indicators = feeds::feodo::parse(&text);
  reconcile_and_apply(FeedSource::FeodoTracker, indicators, gateway)
}

pub fn import_azorult(cfg: &Config, gateway: &mut dyn PlatformGateway) -> anyhow::Result<()> {
  if !cfg.feeds.azorult.enabled {
    tracing::info!("AzorultTracker feed disabled; skipping");
    return Ok(());
  }

  let path = fetch::download_feed(&cfg.feeds.azorult, "azorult.json", Utc::now())
    .context("download AzorultTracker feed")?;
  let text =
    fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;

  let indicators = feeds::azorult::parse(&text).context("parse AzorultTracker feed")?;
  reconcile_and_apply(FeedSource::AzorultTracker, indicators, gateway)
}
