use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Runtime configuration, read from a TOML file. A missing or invalid file
/// is a setup failure and aborts the run; nothing is written back, since the
/// MISP auth key has no sensible default.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub misp: MispConfig,
  pub feeds: FeedsConfig,
  #[serde(default)]
  pub import: ImportConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MispConfig {
  pub url: String,
  pub auth_key: String,

  #[serde(default = "default_timeout_seconds")]
  pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedsConfig {
  pub urlhaus: FeedConfig,
  pub feodo: FeedConfig,
  pub azorult: FeedConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
  pub url: String,
  pub download_dir: PathBuf,

  #[serde(default = "default_true")]
  pub enabled: bool,

  #[serde(default = "default_timeout_seconds")]
  pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportConfig {
  #[serde(default = "default_lookback_days")]
  pub lookback_days: u32,
}

impl Default for ImportConfig {
  fn default() -> Self {
    Self {
      lookback_days: default_lookback_days(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  #[serde(default = "default_log_dir")]
  pub dir: PathBuf,

  #[serde(default = "default_log_level")]
  pub level: String,

  #[serde(default = "default_retention_days")]
  pub retention_days: u64,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      dir: default_log_dir(),
      level: default_log_level(),
      retention_days: default_retention_days(),
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_timeout_seconds() -> u64 {
  30
}

fn default_lookback_days() -> u32 {
  10
}

fn default_log_dir() -> PathBuf {
  PathBuf::from("logs")
}

fn default_log_level() -> String {
  "info".to_string()
}

fn default_retention_days() -> u64 {
  14
}

pub fn load(path: &Path) -> anyhow::Result<Config> {
  let raw = fs::read_to_string(path)
    .with_context(|| format!("read config file {}", path.display()))?;
  let cfg: Config =
    toml::from_str(&raw).with_context(|| format!("parse config file {}", path.display()))?;
  validate(&cfg)?;
  Ok(cfg)
}

fn validate(cfg: &Config) -> anyhow::Result<()> {
  if cfg.misp.auth_key.trim().is_empty() {
    anyhow::bail!("misp.auth_key must not be empty");
  }
  if cfg.misp.timeout_seconds == 0 {
    anyhow::bail!("misp.timeout_seconds must be > 0");
  }
  reqwest::Url::parse(&cfg.misp.url)
    .with_context(|| format!("invalid misp.url: {}", cfg.misp.url))?;

  for (name, feed) in [
    ("urlhaus", &cfg.feeds.urlhaus),
    ("feodo", &cfg.feeds.feodo),
    ("azorult", &cfg.feeds.azorult),
  ] {
    if !feed.enabled {
      continue;
    }
    reqwest::Url::parse(&feed.url)
      .with_context(|| format!("invalid feeds.{name}.url: {}", feed.url))?;
    if feed.timeout_seconds == 0 {
      anyhow::bail!("feeds.{name}.timeout_seconds must be > 0");
    }
  }

  if cfg.import.lookback_days == 0 {
    anyhow::bail!("import.lookback_days must be > 0");
  }

  Ok(())
}
