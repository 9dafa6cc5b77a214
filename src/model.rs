// === Module Header (agents-tooling) START ===
// header: Parsed by scripts/check_module_headers.sh for purpose/role presence; keep keys on single-line entries.
// purpose: Define the wire model (file changes, commits, analysis results, stream and status payloads) shared by backend, store and controller
// role: model/types
// outputs: Serializable structs with stable field names; lenient progress decoding
// invariants: AnalysisResult identity is (sha, filename); progress values are always clamped into 0..=100
// tie_breakers: contracts > orchestration > correctness > performance > minimal_diffs
// === Module Header END ===

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Detected knowledge units for one file, unit name -> score.
pub type UnitScores = BTreeMap<String, f64>;

/// One file touched by one commit.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FileChangeEvent {
  pub sha: String,
  pub filename: String,
  #[serde(default)]
  pub author: String,
  pub timestamp: String,
  #[serde(default, rename = "detected_kus", alias = "detectedUnits", alias = "detected_units")]
  pub detected_units: UnitScores,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Commit {
  pub sha: String,
  pub author: String,
  pub timestamp: String,
  pub file_changes: Vec<FileChangeEvent>,
}

/// A file change enriched with analysis data, as streamed (`file_data`) or stored (`/analyzedb`).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AnalysisResult {
  #[serde(flatten)]
  pub change: FileChangeEvent,
  #[serde(rename = "repoUrl", alias = "repo_url", default, skip_serializing_if = "Option::is_none")]
  pub repo_url: Option<String>,
}

impl AnalysisResult {
  pub fn sha(&self) -> &str {
    &self.change.sha
  }

  pub fn filename(&self) -> &str {
    &self.change.filename
  }

  pub fn timestamp(&self) -> &str {
    &self.change.timestamp
  }

  /// Deduplication identity.
  pub fn key(&self) -> (&str, &str) {
    (&self.change.sha, &self.change.filename)
  }
}

impl From<FileChangeEvent> for AnalysisResult {
  fn from(change: FileChangeEvent) -> Self {
    AnalysisResult { change, repo_url: None }
  }
}

/// One server-sent message on the analysis stream.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct StreamMessage {
  #[serde(rename = "repoUrl", alias = "repo_url", default)]
  pub repo_url: Option<String>,
  #[serde(default, deserialize_with = "progress_opt")]
  pub progress: Option<u8>,
  #[serde(default)]
  pub error: Option<String>,
  #[serde(default)]
  pub file_data: Option<AnalysisResult>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteStatus {
  Idle,
  InProgress,
  Completed,
  Error,
  #[serde(other)]
  Unknown,
}

/// Body of `GET /analysis_status`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StatusReport {
  pub status: RemoteStatus,
  #[serde(default, deserialize_with = "progress_or_zero")]
  pub progress: u8,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error_message: Option<String>,
}

/// Optional JSON body of `GET /analyze` (202 or 409).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct StartBody {
  #[serde(default)]
  pub message: Option<String>,
  #[serde(default)]
  pub transport: Option<String>,
}

/// Body of `GET /historytime`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct CommitHistory {
  #[serde(default)]
  pub commit_dates: Vec<String>,
}

/// Clamp any JSON number into a 0..=100 progress value.
pub fn clamp_progress(raw: f64) -> u8 {
  if raw.is_nan() {
    return 0;
  }
  raw.round().clamp(0.0, 100.0) as u8
}

fn progress_opt<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
  D: Deserializer<'de>,
{
  let raw = Option::<f64>::deserialize(deserializer)?;
  Ok(raw.map(clamp_progress))
}

fn progress_or_zero<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
  D: Deserializer<'de>,
{
  Ok(progress_opt(deserializer)?.unwrap_or(0))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn analysis_result_reads_flat_payload() {
    let v = json!({
      "sha": "abc",
      "filename": "src/lib.rs",
      "author": "ana",
      "timestamp": "2024-03-10T10:00:00Z",
      "detected_kus": { "K1": 2.0, "K7": 1 },
      "repoUrl": "https://github.com/acme/widgets.git"
    });
    let r: AnalysisResult = serde_json::from_value(v).unwrap();
    assert_eq!(r.key(), ("abc", "src/lib.rs"));
    assert_eq!(r.change.detected_units.get("K7"), Some(&1.0));
    assert_eq!(r.repo_url.as_deref(), Some("https://github.com/acme/widgets.git"));
  }

  #[test]
  fn file_change_accepts_camel_case_units_and_missing_author() {
    let v = json!({ "sha": "a", "filename": "f", "timestamp": "2024-01-01", "detectedUnits": { "K2": 3 } });
    let fc: FileChangeEvent = serde_json::from_value(v).unwrap();
    assert_eq!(fc.author, "");
    assert_eq!(fc.detected_units.get("K2"), Some(&3.0));
  }

  #[test]
  fn stream_message_progress_is_clamped() {
    let m: StreamMessage = serde_json::from_value(json!({ "repoUrl": "x", "progress": 140.2 })).unwrap();
    assert_eq!(m.progress, Some(100));
    let m: StreamMessage = serde_json::from_value(json!({ "repoUrl": "x", "progress": 42.6 })).unwrap();
    assert_eq!(m.progress, Some(43));
    let m: StreamMessage = serde_json::from_value(json!({ "repoUrl": "x" })).unwrap();
    assert_eq!(m.progress, None);
  }

  #[test]
  fn status_report_parses_in_progress_and_unknown() {
    let s: StatusReport = serde_json::from_value(json!({ "status": "in-progress", "progress": 35 })).unwrap();
    assert_eq!(s.status, RemoteStatus::InProgress);
    assert_eq!(s.progress, 35);
    let s: StatusReport = serde_json::from_value(json!({ "status": "queued" })).unwrap();
    assert_eq!(s.status, RemoteStatus::Unknown);
    assert_eq!(s.progress, 0);
  }

  #[test]
  fn status_report_keeps_error_message() {
    let s: StatusReport =
      serde_json::from_value(json!({ "status": "error", "progress": 12, "error_message": "clone failed" })).unwrap();
    assert_eq!(s.status, RemoteStatus::Error);
    assert_eq!(s.error_message.as_deref(), Some("clone failed"));
  }
}
