use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;

use crate::error::{ApiError, ApiResult};
use crate::model::{AnalysisResult, FileChangeEvent, StatusReport, StreamMessage};
use crate::repo_key::RepoKey;

use super::{AnalysisApi, MessageStream, StartAck, StreamFrame};

/// Sender half of a scripted stream; dropping it ends the stream.
pub type StreamFeed = mpsc::UnboundedSender<ApiResult<StreamMessage>>;

enum ScriptedStream {
  Open(mpsc::UnboundedReceiver<ApiResult<StreamMessage>>),
  Refused(String),
}

/// In-memory backend with scripted answers.
///
/// Status queues repeat their last entry once drained, so a polling transport keeps
/// seeing the final scripted status. Streams are fed through channels the caller keeps,
/// which lets a test deliver messages at any moment; once the stream is dropped the
/// feed reports itself closed.
#[derive(Default)]
pub struct MemoryApi {
  inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
  commits: HashMap<String, Vec<FileChangeEvent>>,
  start_replies: VecDeque<Result<StartAck, (u16, String)>>,
  start_calls: Vec<String>,
  streams: HashMap<String, VecDeque<ScriptedStream>>,
  stream_opens: Vec<String>,
  statuses: HashMap<RepoKey, VecDeque<Result<StatusReport, String>>>,
  status_calls: HashMap<RepoKey, usize>,
  snapshots: HashMap<RepoKey, Vec<AnalysisResult>>,
  snapshot_calls: HashMap<RepoKey, usize>,
  timestamps: HashMap<RepoKey, Vec<String>>,
  history: HashMap<String, Vec<String>>,
}

impl MemoryApi {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
    // a panicking test thread must not wedge the remaining assertions
    self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn set_commits(&self, repo_url: &str, rows: Vec<FileChangeEvent>) {
    self.state().commits.insert(repo_url.to_string(), rows);
  }

  /// Queue the answer to the next begin-analysis call. Unscripted calls are accepted.
  pub fn push_start(&self, ack: StartAck) {
    self.state().start_replies.push_back(Ok(ack));
  }

  pub fn fail_start(&self, status: u16, body: &str) {
    self.state().start_replies.push_back(Err((status, body.to_string())));
  }

  /// Open a live stream for the next `open_stream(repo_url)`; the returned sender feeds it.
  pub fn stream_channel(&self, repo_url: &str) -> StreamFeed {
    let (tx, rx) = mpsc::unbounded_channel();
    self
      .state()
      .streams
      .entry(repo_url.to_string())
      .or_default()
      .push_back(ScriptedStream::Open(rx));
    tx
  }

  /// Refuse the next `open_stream(repo_url)` the way a 409 or 5xx answer would.
  pub fn refuse_stream(&self, repo_url: &str, message: &str) {
    self
      .state()
      .streams
      .entry(repo_url.to_string())
      .or_default()
      .push_back(ScriptedStream::Refused(message.to_string()));
  }

  /// Script a finite stream: the messages, then end of stream.
  pub fn script_stream(&self, repo_url: &str, messages: Vec<StreamMessage>) {
    let tx = self.stream_channel(repo_url);
    for m in messages {
      let _ = tx.send(Ok(m));
    }
  }

  pub fn push_status(&self, key: &RepoKey, report: StatusReport) {
    self.state().statuses.entry(key.clone()).or_default().push_back(Ok(report));
  }

  pub fn fail_status(&self, key: &RepoKey, message: &str) {
    self
      .state()
      .statuses
      .entry(key.clone())
      .or_default()
      .push_back(Err(message.to_string()));
  }

  pub fn set_snapshot(&self, key: &RepoKey, results: Vec<AnalysisResult>) {
    self.state().snapshots.insert(key.clone(), results);
  }

  pub fn set_timestamps(&self, key: &RepoKey, timestamps: Vec<String>) {
    self.state().timestamps.insert(key.clone(), timestamps);
  }

  pub fn set_history(&self, repo_url: &str, dates: Vec<String>) {
    self.state().history.insert(repo_url.to_string(), dates);
  }

  pub fn start_calls(&self) -> Vec<String> {
    self.state().start_calls.clone()
  }

  pub fn stream_opens(&self) -> Vec<String> {
    self.state().stream_opens.clone()
  }

  pub fn status_calls(&self, key: &RepoKey) -> usize {
    self.state().status_calls.get(key).copied().unwrap_or(0)
  }

  pub fn snapshot_calls(&self, key: &RepoKey) -> usize {
    self.state().snapshot_calls.get(key).copied().unwrap_or(0)
  }
}

impl AnalysisApi for MemoryApi {
  fn fetch_commits(&self, repo_url: &str, limit: Option<u32>) -> ApiResult<Vec<FileChangeEvent>> {
    let rows = self.state().commits.get(repo_url).cloned().unwrap_or_default();

    let Some(limit) = limit else { return Ok(rows) };

    // limit counts commits, not rows
    let mut seen: Vec<String> = Vec::new();
    Ok(
      rows
        .into_iter()
        .filter(|row| {
          if seen.contains(&row.sha) {
            return true;
          }
          if seen.len() < limit as usize {
            seen.push(row.sha.clone());
            return true;
          }
          false
        })
        .collect(),
    )
  }

  fn begin_analysis(&self, repo_url: &str) -> ApiResult<StartAck> {
    let mut state = self.state();
    state.start_calls.push(repo_url.to_string());

    match state.start_replies.pop_front() {
      None => Ok(StartAck::accepted()),
      Some(Ok(ack)) => Ok(ack),
      Some(Err((status, body))) => Err(ApiError::Status {
        endpoint: "/analyze".into(),
        status,
        body,
      }),
    }
  }

  fn open_stream(&self, repo_url: &str) -> ApiResult<MessageStream> {
    let mut state = self.state();
    state.stream_opens.push(repo_url.to_string());

    match state.streams.get_mut(repo_url).and_then(|q| q.pop_front()) {
      Some(ScriptedStream::Open(rx)) => {
        let messages = stream::unfold(rx, |mut rx| async move {
          let item = rx.recv().await?;
          Some((item.map(StreamFrame::Message), rx))
        });
        let opened = stream::iter([Ok(StreamFrame::Opened)]);
        Ok(opened.chain(messages).boxed())
      }
      Some(ScriptedStream::Refused(message)) => Err(ApiError::Refused {
        endpoint: "/analyze".into(),
        message,
      }),
      None => Err(ApiError::Network {
        endpoint: "/analyze".into(),
        message: "connection refused".into(),
      }),
    }
  }

  fn analysis_status(&self, key: &RepoKey) -> ApiResult<StatusReport> {
    let mut state = self.state();
    *state.status_calls.entry(key.clone()).or_insert(0) += 1;

    let reply = match state.statuses.get_mut(key) {
      Some(queue) if queue.len() > 1 => queue.pop_front(),
      Some(queue) => queue.front().cloned(),
      None => None,
    };

    match reply {
      Some(Ok(report)) => Ok(report),
      Some(Err(message)) => Err(ApiError::Network {
        endpoint: "/analysis_status".into(),
        message,
      }),
      None => Ok(StatusReport {
        status: crate::model::RemoteStatus::Idle,
        progress: 0,
        error_message: None,
      }),
    }
  }

  fn fetch_snapshot(&self, key: &RepoKey) -> ApiResult<Vec<AnalysisResult>> {
    let mut state = self.state();
    *state.snapshot_calls.entry(key.clone()).or_insert(0) += 1;
    Ok(state.snapshots.get(key).cloned().unwrap_or_default())
  }

  fn analyzed_timestamps(&self, key: &RepoKey) -> ApiResult<Vec<String>> {
    Ok(self.state().timestamps.get(key).cloned().unwrap_or_default())
  }

  fn commit_history(&self, repo_url: &str) -> ApiResult<Vec<String>> {
    Ok(self.state().history.get(repo_url).cloned().unwrap_or_default())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::RemoteStatus;

  fn status(s: RemoteStatus, p: u8) -> StatusReport {
    StatusReport {
      status: s,
      progress: p,
      error_message: None,
    }
  }

  #[test]
  fn status_queue_repeats_last_entry() {
    let api = MemoryApi::new();
    let key = RepoKey::from_url("widgets");
    api.push_status(&key, status(RemoteStatus::InProgress, 10));
    api.push_status(&key, status(RemoteStatus::Completed, 100));
    assert_eq!(api.analysis_status(&key).unwrap().progress, 10);
    assert_eq!(api.analysis_status(&key).unwrap().status, RemoteStatus::Completed);
    assert_eq!(api.analysis_status(&key).unwrap().status, RemoteStatus::Completed);
    assert_eq!(api.status_calls(&key), 3);
  }

  #[test]
  fn unscripted_stream_is_a_network_error() {
    let api = MemoryApi::new();
    assert!(matches!(api.open_stream("https://x/widgets"), Err(ApiError::Network { .. })));
  }

  #[test]
  fn scripted_stream_opens_then_delivers_and_ends() {
    let api = MemoryApi::new();
    api.refuse_stream("u", "HTTP 409");
    let feed = api.stream_channel("u");
    feed.send(Ok(StreamMessage { repo_url: Some("u".into()), ..Default::default() })).unwrap();
    drop(feed);

    assert!(matches!(api.open_stream("u"), Err(ApiError::Refused { .. })));
    let frames: Vec<_> = futures::executor::block_on(api.open_stream("u").unwrap().collect());
    assert_eq!(frames.len(), 2);
    assert!(matches!(frames[0], Ok(StreamFrame::Opened)));
    assert!(matches!(frames[1], Ok(StreamFrame::Message(_))));
    assert_eq!(api.stream_opens().len(), 2);
  }

  #[test]
  fn commit_limit_counts_commits() {
    let api = MemoryApi::new();
    let row = |sha: &str, f: &str| FileChangeEvent {
      sha: sha.into(),
      filename: f.into(),
      author: "a".into(),
      timestamp: "2024-01-01".into(),
      detected_units: Default::default(),
    };
    api.set_commits("u", vec![row("a", "1"), row("a", "2"), row("b", "3"), row("c", "4")]);
    assert_eq!(api.fetch_commits("u", Some(2)).unwrap().len(), 3);
    assert_eq!(api.fetch_commits("u", None).unwrap().len(), 4);
  }
}
