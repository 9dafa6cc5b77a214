use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use crate::controller::ControllerSettings;
use crate::transport::{TransportKind, TransportTiming};

#[derive(Parser, Debug)]
#[command(
    name = "analysis-tracker",
    version,
    about = "Start, attach to and follow repository analysis jobs; print results as JSON",
    long_about = None
)]
pub struct Cli {
  /// Base URL of the analysis backend
  #[arg(long, env = "ANALYSIS_API_URL", default_value = "http://localhost:5000", global = true)]
  pub api_url: String,

  /// Progress transport used when the backend does not name one
  #[arg(long, value_enum, default_value_t = TransportKind::Stream, global = true)]
  pub transport: TransportKind,

  /// Interval between status queries while polling
  #[arg(long, default_value_t = 3000, global = true)]
  pub poll_interval_ms: u64,

  /// Pause after a 100% stream message before re-fetching stored results
  #[arg(long, default_value_t = 500, global = true)]
  pub settle_delay_ms: u64,

  /// Timeout for non-streaming requests
  #[arg(long, default_value_t = 30, global = true)]
  pub request_timeout_secs: u64,

  /// Give up following a job after this many seconds (default: wait indefinitely)
  #[arg(long, global = true)]
  pub timeout_secs: Option<u64>,

  /// Output file for the JSON report ("-" for stdout)
  #[arg(long, default_value = "-", global = true)]
  pub out: String,

  /// Increase log verbosity (-v info, -vv debug, -vvv trace); RUST_LOG overrides
  #[arg(short, long, action = clap::ArgAction::Count, global = true)]
  pub verbose: u8,

  /// Emit a troff man page to stdout (internal; for packaging)
  #[arg(long, hide = true)]
  pub gen_man: bool,

  #[command(subcommand)]
  pub command: Option<Command>,
}

#[derive(Args, Debug, Clone)]
pub struct WindowArgs {
  /// Window width in months, ending at the newest result (default: whole history)
  #[arg(long)]
  pub months: Option<u32>,

  /// Include the windowed results themselves, not just the summary
  #[arg(long)]
  pub include_results: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
  /// Load commits, start (or attach to) the analysis and follow it to the end
  Analyze {
    repo_url: String,
    /// Number of commits to load before starting
    #[arg(long)]
    limit: Option<u32>,
    #[command(flatten)]
    window: WindowArgs,
  },
  /// Re-attach to an analysis already running for the repository and follow it
  Attach {
    repo_url: String,
    #[command(flatten)]
    window: WindowArgs,
  },
  /// Print stored results without starting anything
  Results {
    repo_url: String,
    #[command(flatten)]
    window: WindowArgs,
  },
  /// Print the repository's commits grouped by sha
  Commits {
    repo_url: String,
    #[arg(long)]
    limit: Option<u32>,
  },
  /// Print timestamps of commits already analyzed
  Timestamps { repo_url: String },
  /// Print commit dates of the whole repository
  History { repo_url: String },
  /// Print the repository key derived from a URL
  Key { repo_url: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
  Analyze {
    repo_url: String,
    limit: Option<u32>,
    months: Option<u32>,
    include_results: bool,
  },
  Attach {
    repo_url: String,
    months: Option<u32>,
    include_results: bool,
  },
  Results {
    repo_url: String,
    months: Option<u32>,
    include_results: bool,
  },
  Commits {
    repo_url: String,
    limit: Option<u32>,
  },
  Timestamps {
    repo_url: String,
  },
  History {
    repo_url: String,
  },
  Key {
    repo_url: String,
  },
}

#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
  pub api_url: String,
  pub transport: TransportKind,
  pub poll_interval: Duration,
  pub settle_delay: Duration,
  pub request_timeout: Duration,
  pub deadline: Option<Duration>,
  pub out: String,
  pub verbosity: u8,
  pub action: Action,
}

impl EffectiveConfig {
  pub fn controller_settings(&self) -> ControllerSettings {
    ControllerSettings {
      transport: self.transport,
      timing: TransportTiming {
        poll_interval: self.poll_interval,
        settle_delay: self.settle_delay,
      },
    }
  }
}

fn check_repo_url(url: &str) -> Result<String> {
  let trimmed = url.trim();
  if trimmed.is_empty() {
    bail!("Repository URL must not be empty");
  }
  Ok(trimmed.to_string())
}

fn check_months(months: Option<u32>) -> Result<Option<u32>> {
  if months == Some(0) {
    bail!("--months must be at least 1");
  }
  Ok(months)
}

fn check_limit(limit: Option<u32>) -> Result<Option<u32>> {
  if limit == Some(0) {
    bail!("--limit must be at least 1");
  }
  Ok(limit)
}

pub fn normalize(cli: Cli) -> Result<EffectiveConfig> {
  let api_url = cli.api_url.trim().trim_end_matches('/').to_string();
  if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
    bail!("--api-url must be an http:// or https:// URL (got {:?})", cli.api_url);
  }

  if cli.poll_interval_ms == 0 {
    bail!("--poll-interval-ms must be greater than 0");
  }

  if cli.request_timeout_secs == 0 {
    bail!("--request-timeout-secs must be greater than 0");
  }

  let action = match cli.command {
    None => bail!("Provide a command: analyze, attach, results, commits, timestamps, history or key"),
    Some(Command::Analyze { repo_url, limit, window }) => Action::Analyze {
      repo_url: check_repo_url(&repo_url)?,
      limit: check_limit(limit)?,
      months: check_months(window.months)?,
      include_results: window.include_results,
    },
    Some(Command::Attach { repo_url, window }) => Action::Attach {
      repo_url: check_repo_url(&repo_url)?,
      months: check_months(window.months)?,
      include_results: window.include_results,
    },
    Some(Command::Results { repo_url, window }) => Action::Results {
      repo_url: check_repo_url(&repo_url)?,
      months: check_months(window.months)?,
      include_results: window.include_results,
    },
    Some(Command::Commits { repo_url, limit }) => Action::Commits {
      repo_url: check_repo_url(&repo_url)?,
      limit: check_limit(limit)?,
    },
    Some(Command::Timestamps { repo_url }) => Action::Timestamps {
      repo_url: check_repo_url(&repo_url)?,
    },
    Some(Command::History { repo_url }) => Action::History {
      repo_url: check_repo_url(&repo_url)?,
    },
    Some(Command::Key { repo_url }) => Action::Key {
      repo_url: check_repo_url(&repo_url)?,
    },
  };

  Ok(EffectiveConfig {
    api_url,
    transport: cli.transport,
    poll_interval: Duration::from_millis(cli.poll_interval_ms),
    settle_delay: Duration::from_millis(cli.settle_delay_ms),
    request_timeout: Duration::from_secs(cli.request_timeout_secs),
    deadline: cli.timeout_secs.map(Duration::from_secs),
    out: cli.out,
    verbosity: cli.verbose,
    action,
  })
}
