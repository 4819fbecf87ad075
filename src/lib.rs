pub mod bucket;
pub mod config;
pub mod feeds;
pub mod fetch;
pub mod import;
pub mod logging;
pub mod misp;
pub mod reconcile;
pub mod types;

use std::path::Path;

/// One synchronous batch run: the three feeds import strictly in sequence.
/// Setup failures (config, download, known-set fetch) abort the run; bucket
/// failures are contained inside the apply step.
pub fn run(config_path: &Path) -> anyhow::Result<()> {
  let cfg = config::load(config_path)?;
  logging::init(
    &cfg.logging.dir,
    &cfg.logging.level,
    cfg.logging.retention_days,
  )?;

  tracing::info!("starting misp feed import");
  let mut gateway = misp::MispGateway::new(&cfg.misp)?;

  import::import_urlhaus(&cfg, &mut gateway)?;
  import::import_feodo(&cfg, &mut gateway)?;
  import::import_azorult(&cfg, &mut gateway)?;

  tracing::info!("finished misp feed import");
  Ok(())
}
