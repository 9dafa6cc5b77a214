use std::collections::BTreeMap;

use serde::Serialize;

use crate::commit;
use crate::controller::{JobController, JobStatus};
use crate::model::{AnalysisResult, Commit};
use crate::window::WindowInfo;

#[derive(Debug, Serialize, Default, PartialEq)]
pub struct ResultsSummary {
  /// Results held for the repository, regardless of window.
  pub total: usize,
  /// Results inside the window.
  pub count: usize,
  pub commits: usize,
  pub authors: BTreeMap<String, usize>,
  /// Summed unit scores inside the window.
  pub units: BTreeMap<String, f64>,
}

#[derive(Debug, Serialize)]
pub struct ResultsReport {
  pub status: JobStatus,
  pub window: Option<WindowInfo>,
  pub summary: ResultsSummary,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub results: Option<Vec<AnalysisResult>>,
}

pub fn summarize(total: usize, windowed: &[AnalysisResult]) -> ResultsSummary {
  let mut summary = ResultsSummary {
    total,
    count: windowed.len(),
    ..Default::default()
  };

  let mut shas: Vec<&str> = Vec::new();

  for r in windowed {
    if !shas.contains(&r.sha()) {
      shas.push(r.sha());
    }

    let author = if r.change.author.is_empty() { "unknown" } else { r.change.author.as_str() };
    *summary.authors.entry(author.to_string()).or_insert(0) += 1;

    for (unit, score) in &r.change.detected_units {
      *summary.units.entry(unit.clone()).or_insert(0.0) += score;
    }
  }

  summary.commits = shas.len();
  summary
}

pub fn results_report(controller: &JobController, selected_months: u32, include_results: bool) -> ResultsReport {
  let windowed = controller.filtered_results(selected_months);
  let summary = summarize(controller.results().len(), &windowed);

  ResultsReport {
    status: controller.status(),
    window: controller.window(selected_months).map(|w| w.info()),
    summary,
    results: include_results.then_some(windowed),
  }
}

#[derive(Debug, Serialize)]
pub struct CommitsReport {
  pub repo: String,
  pub commits: usize,
  pub files: usize,
  pub items: Vec<Commit>,
}

pub fn commits_report(repo: &str, commits: &[Commit]) -> CommitsReport {
  CommitsReport {
    repo: repo.to_string(),
    commits: commits.len(),
    files: commit::total_files(commits),
    items: commits.to_vec(),
  }
}
