use crate::config::FeedConfig;
use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, Response};
use reqwest::header::USER_AGENT;
use reqwest::Url;
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

const MAX_FEED_BYTES: usize = 256 * 1024 * 1024;

/// Downloads one feed file and stores it under the feed's download
/// directory as `<year>/<name>.<YYYYMMDD-HH>`, returning the written path.
/// Any failure here is a setup failure for the run.
pub fn download_feed(cfg: &FeedConfig, name: &str, now: DateTime<Utc>) -> anyhow::Result<PathBuf> {
  let url = Url::parse(&cfg.url).with_context(|| format!("invalid feed URL: {}", cfg.url))?;

  let client = Client::builder()
    .timeout(Duration::from_secs(cfg.timeout_seconds))
    .build()
    .context("build feed HTTP client")?;

  let response = client
    .get(url.clone())
    .header(
      USER_AGENT,
      format!("misp-feed-importer/{}", env!("CARGO_PKG_VERSION")),
    )
    .send()
    .with_context(|| format!("GET {url}"))?;

  if !response.status().is_success() {
    anyhow::bail!("unexpected HTTP status {} for {url}", response.status().as_u16());
  }

  let body = read_response_with_limit(response, MAX_FEED_BYTES)?;

  let dir = cfg.download_dir.join(now.format("%Y").to_string());
  fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
  let path = dir.join(format!("{name}.{}", now.format("%Y%m%d-%H")));
  fs::write(&path, &body).with_context(|| format!("write {}", path.display()))?;

  tracing::debug!(path = %path.display(), bytes = body.len(), "feed downloaded");
  Ok(path)
}

fn read_response_with_limit(response: Response, max_bytes: usize) -> anyhow::Result<Vec<u8>> {
  let mut out = Vec::new();
  let mut limited = response.take((max_bytes.saturating_add(1)) as u64);
  limited.read_to_end(&mut out).context("read response body")?;

  if out.len() > max_bytes {
    anyhow::bail!("feed response exceeds max size {} bytes", max_bytes);
  }

  Ok(out)
}
