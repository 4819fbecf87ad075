use anyhow::Context;
use std::path::PathBuf;

fn main() -> anyhow::Result<()> {
  let args: Vec<String> = std::env::args().collect();

  if args.iter().any(|a| a == "--version") {
    println!("{}", env!("CARGO_PKG_VERSION"));
    return Ok(());
  }

  let config_path = args
    .windows(2)
    .find(|pair| pair[0] == "--config")
    .map(|pair| PathBuf::from(&pair[1]))
    .unwrap_or_else(|| PathBuf::from("etc/config.toml"));

  misp_feed_importer::run(&config_path).context("run feed import")
}
