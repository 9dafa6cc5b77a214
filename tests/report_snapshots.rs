use std::sync::Arc;
use std::time::{Duration, Instant};

use analysis_tracker::backend::memory::MemoryApi;
use analysis_tracker::controller::{JobController, JobState};
use analysis_tracker::model::{AnalysisResult, FileChangeEvent};
use analysis_tracker::repo_key::RepoKey;
use analysis_tracker::report;
use analysis_tracker::transport::TransportKind;

mod common;
use common::{progress, settings, ALPHA};

fn row(sha: &str, filename: &str, author: &str, ts: &str, units: &[(&str, f64)]) -> FileChangeEvent {
  FileChangeEvent {
    sha: sha.into(),
    filename: filename.into(),
    author: author.into(),
    timestamp: ts.into(),
    detected_units: units.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
  }
}

fn stored_results() -> Vec<AnalysisResult> {
  vec![
    row("c1", "src/lib.rs", "ana", "2024-01-05T08:00:00Z", &[("K1", 0.25)]),
    row("c2", "src/api.rs", "bo", "2024-02-14T12:30:00Z", &[("K1", 0.5), ("K2", 1.25)]),
    row("c2", "src/db.rs", "bo", "2024-02-14T12:30:00Z", &[("K2", 0.5)]),
    row("c3", "README.md", "ana", "2024-03-20T09:30:00Z", &[("K3", 0.125)]),
  ]
  .into_iter()
  .map(AnalysisResult::from)
  .collect()
}

#[test]
fn results_report_for_a_completed_job() {
  common::init_tracing();
  let api = Arc::new(MemoryApi::new());
  api.script_stream(ALPHA, vec![progress(ALPHA, 50), progress(ALPHA, 100)]);
  api.set_snapshot(&RepoKey::from_url(ALPHA), stored_results());

  let mut c = JobController::new(api, settings(TransportKind::Stream));
  c.start_analysis(ALPHA);
  assert_eq!(c.run_until_settled(Some(Instant::now() + Duration::from_secs(5))), JobState::Completed);

  let report = report::results_report(&c, 2, true);
  insta::assert_json_snapshot!(report, {
    ".summary.units.*" => insta::rounded_redaction(2),
  });
}

#[test]
fn commits_report_groups_rows_by_sha() {
  common::init_tracing();
  let api = Arc::new(MemoryApi::new());
  api.set_commits(
    ALPHA,
    vec![
      row("c9", "src/main.rs", "ana", "2024-04-02T16:45:00Z", &[("K1", 0.25)]),
      row("c9", "Cargo.toml", "ana", "2024-04-02T16:45:00Z", &[("K5", 0.5)]),
      row("c8", "src/cli.rs", "bo", "2024-04-01T11:15:00Z", &[("K4", 0.75)]),
    ],
  );

  let mut c = JobController::new(api, settings(TransportKind::Poll));
  c.select_repository(ALPHA);
  let commits = c.load_commits(None).unwrap().to_vec();

  let report = report::commits_report(ALPHA, &commits);
  insta::assert_json_snapshot!(report, {
    ".repo" => "[repo]",
  });
}
