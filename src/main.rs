use anyhow::Result;
use clap::Parser;

use analysis_tracker::cli::{normalize, Cli};
use analysis_tracker::{logging, run, util};

fn main() -> Result<()> {
  let cli = Cli::parse();

  if cli.gen_man {
    let page = util::render_man_page::<Cli>()?;
    print!("{}", page);
    return Ok(());
  }

  logging::init(cli.verbose);

  let cfg = normalize(cli)?;
  tracing::debug!(config = ?cfg, "effective configuration");

  run::run(&cfg)
}
