// === Module Header (agents-tooling) START ===
// header: Parsed by scripts/check_module_headers.sh for purpose/role presence; keep keys on single-line entries.
// purpose: Execute one normalized CLI action against the analysis backend and emit its JSON report
// role: processing/orchestrator
// inputs: EffectiveConfig, an AnalysisApi implementation
// outputs: Pretty JSON on stdout or in the --out file
// side_effects: Network calls; writes the output file (creating parent directories)
// invariants:
// - a job that ends in the error state (or is still live at the deadline) makes the run fail after the report is written
// - stdout carries only the JSON report; diagnostics go to the log on stderr
// errors: anyhow with context naming the failing step or output path
// tie_breakers: contracts > orchestration > correctness > performance > minimal_diffs
// === Module Header END ===

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::json;

use crate::backend::{AnalysisApi, HttpApi};
use crate::cli::{Action, EffectiveConfig};
use crate::controller::{JobController, JobState};
use crate::report::{commits_report, results_report};
use crate::repo_key::RepoKey;

pub fn write_output<T: Serialize>(out: &str, value: &T) -> Result<()> {
  let body = serde_json::to_string_pretty(value)?;

  if out == "-" {
    println!("{}", body);
    return Ok(());
  }

  let path = Path::new(out);
  if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
    std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
  }
  std::fs::write(path, body + "\n").with_context(|| format!("writing {}", path.display()))?;
  Ok(())
}

fn months_or_all(months: Option<u32>) -> u32 {
  months.unwrap_or(u32::MAX)
}

/// Follows the controller's job until it settles or the configured deadline passes.
fn follow(cfg: &EffectiveConfig, controller: &mut JobController) -> JobState {
  let deadline = cfg.deadline.map(|d| Instant::now() + d);
  controller.run_until_settled(deadline)
}

fn settle_outcome(state: JobState, controller: &JobController) -> Result<()> {
  match state {
    JobState::Error => {
      let status = controller.status();
      bail!("{}", status.message)
    }
    s if s.is_live() => bail!("Timed out waiting for the analysis (state: {s})"),
    _ => Ok(()),
  }
}

/// Runs `cfg.action` against `api`.
pub fn execute(cfg: &EffectiveConfig, api: Arc<dyn AnalysisApi>) -> Result<()> {
  let mut controller = JobController::new(api, cfg.controller_settings());

  match &cfg.action {
    Action::Key { repo_url } => {
      let key = RepoKey::from_url(repo_url);
      write_output(&cfg.out, &json!({ "repo_url": repo_url, "key": key }))
    }
    Action::Commits { repo_url, limit } => {
      controller.select_repository(repo_url);
      let commits = controller.load_commits(*limit).context("loading commits")?;
      write_output(&cfg.out, &commits_report(repo_url, commits))
    }
    Action::Timestamps { repo_url } => {
      controller.select_repository(repo_url);
      let timestamps = controller.analyzed_timestamps().context("loading analyzed timestamps")?;
      write_output(
        &cfg.out,
        &json!({ "key": RepoKey::from_url(repo_url), "count": timestamps.len(), "timestamps": timestamps }),
      )
    }
    Action::History { repo_url } => {
      controller.select_repository(repo_url);
      let dates = controller.commit_history().context("loading commit history")?;
      write_output(
        &cfg.out,
        &json!({ "repo_url": repo_url, "count": dates.len(), "commit_dates": dates }),
      )
    }
    Action::Results {
      repo_url,
      months,
      include_results,
    } => {
      // a running job is reported with its current progress; `attach` follows it
      controller.select_repository(repo_url);
      write_output(
        &cfg.out,
        &results_report(&controller, months_or_all(*months), *include_results),
      )
    }
    Action::Attach {
      repo_url,
      months,
      include_results,
    } => {
      controller.select_repository(repo_url);
      let state = follow(cfg, &mut controller);
      write_output(
        &cfg.out,
        &results_report(&controller, months_or_all(*months), *include_results),
      )?;
      settle_outcome(state, &controller)
    }
    Action::Analyze {
      repo_url,
      limit,
      months,
      include_results,
    } => {
      controller.select_repository(repo_url);

      match controller.load_commits(*limit) {
        Ok(commits) => tracing::info!(commits = commits.len(), "commits ready"),
        Err(err) => tracing::warn!(error = %err, "could not load commits; starting analysis anyway"),
      }

      controller.start_analysis(repo_url);
      let state = follow(cfg, &mut controller);
      write_output(
        &cfg.out,
        &results_report(&controller, months_or_all(*months), *include_results),
      )?;
      settle_outcome(state, &controller)
    }
  }
}

/// Builds the HTTP backend from `cfg` and runs the action.
pub fn run(cfg: &EffectiveConfig) -> Result<()> {
  let api = HttpApi::new(&cfg.api_url, cfg.request_timeout);
  tracing::debug!(api = api.base_url(), "using analysis backend");
  execute(cfg, Arc::new(api))
}
