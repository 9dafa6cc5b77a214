// === Module Header (agents-tooling) START ===
// header: Parsed by scripts/check_module_headers.sh for purpose/role presence; keep keys on single-line entries.
// purpose: Drive the analysis job lifecycle for the selected repository: start or attach, follow one transport, keep results, re-fetch on completion
// role: controller/state-machine
// inputs: AnalysisApi, ControllerSettings, repository URLs from the caller, SessionEvents from transport workers
// outputs: JobState/JobStatus snapshots, ResultStore contents, subscriber notifications
// side_effects: Network calls through AnalysisApi; opens and cancels TransportSessions
// invariants:
// - at most one live TransportSession; the previous one is cancelled before a new one opens
// - events stamped with any session id other than the live one are dropped
// - start_analysis for the key already being tracked live sends no request
// - in stream mode the stream request is the only begin-analysis request sent
// - the ResultStore only ever holds results for the active repository key
// errors: Failures land in JobState::Error with the JobFailure message verbatim; best-effort fetches log a warning
// tie_breakers: contracts > orchestration > correctness > performance > minimal_diffs
// === Module Header END ===

use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::backend::{AnalysisApi, StartDisposition};
use crate::commit;
use crate::error::{ApiResult, JobFailure};
use crate::model::{AnalysisResult, Commit, RemoteStatus};
use crate::repo_key::RepoKey;
use crate::store::ResultStore;
use crate::transport::{
  progress_message, SessionEvent, SessionId, TransportEvent, TransportKind, TransportSession, TransportTiming,
  ALREADY_RUNNING,
};
use crate::window::{self, TimeWindow};

const TICK: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
  Idle,
  Starting,
  Attaching,
  Streaming,
  Polling,
  Completed,
  Error,
}

impl JobState {
  /// States in which a job is being started or followed.
  pub fn is_live(self) -> bool {
    matches!(
      self,
      JobState::Starting | JobState::Attaching | JobState::Streaming | JobState::Polling
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      JobState::Idle => "idle",
      JobState::Starting => "starting",
      JobState::Attaching => "attaching",
      JobState::Streaming => "streaming",
      JobState::Polling => "polling",
      JobState::Completed => "completed",
      JobState::Error => "error",
    }
  }
}

impl fmt::Display for JobState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Everything a presentation layer needs to render the job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
  pub repo_key: Option<RepoKey>,
  pub state: JobState,
  pub progress: u8,
  pub message: String,
  pub failure: Option<JobFailure>,
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
  /// Transport used when the backend does not name one.
  pub transport: TransportKind,
  pub timing: TransportTiming,
}

impl Default for ControllerSettings {
  fn default() -> Self {
    ControllerSettings {
      transport: TransportKind::Stream,
      timing: TransportTiming::default(),
    }
  }
}

type Subscriber = Box<dyn FnMut(&JobStatus)>;

struct ActiveRepo {
  key: RepoKey,
  url: String,
}

pub struct JobController {
  api: Arc<dyn AnalysisApi>,
  settings: ControllerSettings,
  active: Option<ActiveRepo>,
  state: JobState,
  progress: u8,
  message: String,
  last_failure: Option<JobFailure>,
  session: Option<TransportSession>,
  next_session: u64,
  events_tx: mpsc::Sender<SessionEvent>,
  events_rx: mpsc::Receiver<SessionEvent>,
  store: ResultStore,
  commits: Vec<Commit>,
  subscribers: Vec<Subscriber>,
}

impl JobController {
  pub fn new(api: Arc<dyn AnalysisApi>, settings: ControllerSettings) -> Self {
    let (events_tx, events_rx) = mpsc::channel();

    JobController {
      api,
      settings,
      active: None,
      state: JobState::Idle,
      progress: 0,
      message: String::new(),
      last_failure: None,
      session: None,
      next_session: 0,
      events_tx,
      events_rx,
      store: ResultStore::new(),
      commits: Vec::new(),
      subscribers: Vec::new(),
    }
  }

  pub fn state(&self) -> JobState {
    self.state
  }

  pub fn repo_key(&self) -> Option<&RepoKey> {
    self.active.as_ref().map(|a| &a.key)
  }

  pub fn status(&self) -> JobStatus {
    JobStatus {
      repo_key: self.repo_key().cloned(),
      state: self.state,
      progress: self.progress,
      message: self.message.clone(),
      failure: self.last_failure.clone(),
    }
  }

  /// Id of the live transport session, if any.
  pub fn session_id(&self) -> Option<SessionId> {
    self.session.as_ref().map(|s| s.id())
  }

  /// Transport currently following the job. A refused stream continues as polling.
  pub fn transport(&self) -> Option<TransportKind> {
    let session = self.session.as_ref()?;
    match self.state {
      JobState::Streaming => Some(TransportKind::Stream),
      JobState::Polling => Some(TransportKind::Poll),
      _ => Some(session.kind()),
    }
  }

  pub fn results(&self) -> &ResultStore {
    &self.store
  }

  pub fn filtered_results(&self, selected_months: u32) -> Vec<AnalysisResult> {
    window::filter(&self.store, selected_months)
  }

  pub fn window(&self, selected_months: u32) -> Option<TimeWindow> {
    TimeWindow::for_store(&self.store, selected_months)
  }

  pub fn commits(&self) -> &[Commit] {
    &self.commits
  }

  /// Registers `callback`; it runs after every state, progress or result change.
  pub fn subscribe<F>(&mut self, callback: F)
  where
    F: FnMut(&JobStatus) + 'static,
  {
    self.subscribers.push(Box::new(callback));
  }

  fn notify(&mut self) {
    if self.subscribers.is_empty() {
      return;
    }
    let status = self.status();
    for sub in self.subscribers.iter_mut() {
      sub(&status);
    }
  }

  fn set_state(&mut self, state: JobState, message: impl Into<String>) {
    let message = message.into();
    if self.state != state {
      tracing::info!(
        repo = %self.repo_key().map(RepoKey::as_str).unwrap_or("-"),
        from = %self.state,
        state = %state,
        "job state changed"
      );
    }
    self.state = state;
    self.message = message;
  }

  fn cancel_session(&mut self) {
    if let Some(mut session) = self.session.take() {
      session.cancel();
    }
  }

  /// Makes `repo_url` the active repository. Returns true when the key changed.
  fn switch_to(&mut self, repo_url: &str) -> bool {
    let key = RepoKey::from_url(repo_url);

    if let Some(active) = self.active.as_mut() {
      if active.key == key {
        active.url = repo_url.trim().to_string();
        return false;
      }
    }

    self.cancel_session();
    self.store = ResultStore::new();
    self.commits.clear();
    self.progress = 0;
    self.last_failure = None;
    tracing::info!(repo = %key, "switched repository");
    self.active = Some(ActiveRepo {
      key,
      url: repo_url.trim().to_string(),
    });
    self.set_state(JobState::Idle, "");
    true
  }

  fn open_session(&mut self, kind: TransportKind) {
    self.cancel_session();

    let Some(url) = self.active.as_ref().map(|a| a.url.clone()) else {
      return;
    };

    self.next_session += 1;

    let session = TransportSession::open(
      SessionId(self.next_session),
      kind,
      &url,
      Arc::clone(&self.api),
      self.settings.timing,
      self.events_tx.clone(),
    );
    self.session = Some(session);
  }

  fn load_snapshot(&mut self, key: &RepoKey) {
    match self.api.fetch_snapshot(key) {
      Ok(rows) => {
        tracing::debug!(repo = %key, count = rows.len(), "snapshot loaded");
        self.store.replace_all(rows);
      }
      Err(err) => tracing::warn!(repo = %key, error = %err, "snapshot fetch failed"),
    }
  }

  /// Shows `repo_url` and re-attaches to a job already running for it.
  pub fn select_repository(&mut self, repo_url: &str) {
    let changed = self.switch_to(repo_url);

    if !changed && self.state.is_live() {
      tracing::debug!(state = %self.state, "repository already tracked");
      return;
    }

    let Some(key) = self.repo_key().cloned() else {
      return;
    };

    self.load_snapshot(&key);
    self.set_state(JobState::Attaching, "Checking for a running analysis...");
    self.notify();

    match self.api.analysis_status(&key) {
      Ok(report) if report.status == RemoteStatus::InProgress => {
        self.open_session(TransportKind::Poll);
        self.progress = report.progress;
        self.set_state(JobState::Polling, progress_message(report.progress));
      }
      Ok(report) => {
        tracing::debug!(repo = %key, status = ?report.status, "no running analysis");
        self.set_state(JobState::Idle, "");
      }
      Err(err) => {
        tracing::warn!(repo = %key, error = %err, "status check failed");
        self.set_state(JobState::Idle, "");
      }
    }

    self.notify();
  }

  /// Starts (or attaches to) the analysis of `repo_url`.
  ///
  /// With the stream transport the event stream request begins the job, and the state
  /// moves on once the stream opens (or the backend reports the job already running).
  /// With polling a plain begin request is sent first.
  pub fn start_analysis(&mut self, repo_url: &str) {
    let changed = self.switch_to(repo_url);

    if !changed && self.state.is_live() {
      tracing::debug!(state = %self.state, "analysis already tracked; not starting again");
      return;
    }

    let url = repo_url.trim().to_string();
    self.progress = 0;
    self.last_failure = None;
    self.set_state(JobState::Starting, "Starting analysis...");
    self.notify();

    if self.settings.transport == TransportKind::Stream {
      self.open_session(TransportKind::Stream);
      return;
    }

    match self.api.begin_analysis(&url) {
      Ok(ack) => {
        let kind = ack.transport.unwrap_or(self.settings.transport);
        let message = match ack.disposition {
          StartDisposition::Accepted => ack.message.unwrap_or_else(|| "Analysis started.".to_string()),
          StartDisposition::AlreadyRunning => ack.message.unwrap_or_else(|| ALREADY_RUNNING.to_string()),
        };

        self.open_session(kind);
        let state = match kind {
          TransportKind::Stream => JobState::Streaming,
          TransportKind::Poll => JobState::Polling,
        };
        self.set_state(state, message);
      }
      Err(err) => {
        self.fail(JobFailure::start(format!("Failed to start analysis: {err}")));
        return;
      }
    }

    self.notify();
  }

  /// Stops following the job. The backend job itself keeps running.
  pub fn cancel(&mut self) {
    self.cancel_session();
    self.progress = 0;
    self.set_state(JobState::Idle, "Analysis tracking cancelled.");
    self.notify();
  }

  fn fail(&mut self, failure: JobFailure) {
    self.cancel_session();
    tracing::warn!(
      repo = %self.repo_key().map(RepoKey::as_str).unwrap_or("-"),
      kind = ?failure.kind,
      "{}",
      failure.message
    );
    self.set_state(JobState::Error, failure.message.clone());
    self.last_failure = Some(failure);
    self.notify();
  }

  fn complete(&mut self) {
    self.cancel_session();
    self.progress = 100;

    if let Some(key) = self.repo_key().cloned() {
      self.load_snapshot(&key);
    }

    self.set_state(JobState::Completed, "Analysis complete.");
    self.notify();
  }

  /// Applies one transport event. Events of any session but the live one are dropped.
  pub fn handle_event(&mut self, ev: SessionEvent) {
    if self.session_id() != Some(ev.session) {
      tracing::trace!(session = %ev.session, "dropping event from a stale session");
      return;
    }

    match ev.event {
      TransportEvent::Attached { kind, message } => {
        let message = match message {
          Some(m) => m,
          None if self.state == JobState::Starting => "Analysis started.".to_string(),
          None => self.message.clone(),
        };
        let state = match kind {
          TransportKind::Stream => JobState::Streaming,
          TransportKind::Poll => JobState::Polling,
        };
        self.set_state(state, message);
        self.notify();
      }
      TransportEvent::Progress { progress, message } => {
        tracing::debug!(session = %ev.session, progress, "progress");
        self.progress = progress;
        self.message = message;
        self.notify();
      }
      TransportEvent::Result(result) => {
        if self.store.append(result) {
          self.notify();
        }
      }
      TransportEvent::Failed(failure) => self.fail(failure),
      TransportEvent::Complete => self.complete(),
    }
  }

  /// Applies every event already queued. Returns how many were taken.
  pub fn pump(&mut self) -> usize {
    let mut taken = 0;
    while let Ok(ev) = self.events_rx.try_recv() {
      self.handle_event(ev);
      taken += 1;
    }
    taken
  }

  /// Blocks up to `timeout` for the next event, then drains the queue. False on timeout.
  pub fn wait_for_event(&mut self, timeout: Duration) -> bool {
    match self.events_rx.recv_timeout(timeout) {
      Ok(ev) => {
        self.handle_event(ev);
        self.pump();
        true
      }
      Err(_) => false,
    }
  }

  /// Follows the job until it leaves the live states or `deadline` passes.
  pub fn run_until_settled(&mut self, deadline: Option<Instant>) -> JobState {
    while self.state.is_live() && self.session.is_some() {
      let wait = match deadline {
        Some(d) => {
          let now = Instant::now();
          if now >= d {
            tracing::warn!(state = %self.state, "gave up waiting for the analysis");
            break;
          }
          (d - now).min(TICK)
        }
        None => TICK,
      };
      self.wait_for_event(wait);
    }
    self.state
  }

  /// `POST /commits` for the active repository, grouped by sha.
  pub fn load_commits(&mut self, limit: Option<u32>) -> ApiResult<&[Commit]> {
    let Some(active) = self.active.as_ref() else {
      return Ok(&[]);
    };

    let rows = self.api.fetch_commits(&active.url, limit)?;
    self.commits = commit::group(&rows);
    tracing::info!(repo = %active.key, commits = self.commits.len(), files = rows.len(), "commits loaded");
    Ok(&self.commits)
  }

  pub fn analyzed_timestamps(&self) -> ApiResult<Vec<String>> {
    match self.active.as_ref() {
      Some(active) => self.api.analyzed_timestamps(&active.key),
      None => Ok(Vec::new()),
    }
  }

  pub fn commit_history(&self) -> ApiResult<Vec<String>> {
    match self.active.as_ref() {
      Some(active) => self.api.commit_history(&active.url),
      None => Ok(Vec::new()),
    }
  }
}

impl Drop for JobController {
  fn drop(&mut self) {
    self.cancel_session();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::memory::MemoryApi;
  use crate::backend::StartAck;
  use crate::error::FailureKind;
  use crate::model::{FileChangeEvent, StatusReport};
  use std::cell::RefCell;
  use std::rc::Rc;

  const A: &str = "https://github.com/acme/alpha.git";

  fn controller(api: &Arc<MemoryApi>) -> JobController {
    controller_with(api, TransportKind::Stream)
  }

  fn controller_with(api: &Arc<MemoryApi>, transport: TransportKind) -> JobController {
    let settings = ControllerSettings {
      transport,
      timing: TransportTiming {
        poll_interval: Duration::from_millis(5),
        settle_delay: Duration::from_millis(5),
      },
    };
    JobController::new(api.clone(), settings)
  }

  fn result(sha: &str, ts: &str) -> AnalysisResult {
    AnalysisResult::from(FileChangeEvent {
      sha: sha.into(),
      filename: "a.rs".into(),
      author: "dev".into(),
      timestamp: ts.into(),
      detected_units: Default::default(),
    })
  }

  #[test]
  fn starts_idle() {
    let api = Arc::new(MemoryApi::new());
    let c = controller(&api);
    assert_eq!(c.state(), JobState::Idle);
    assert_eq!(c.status().repo_key, None);
    assert!(c.results().is_empty());
  }

  #[test]
  fn start_failure_is_error_and_restartable() {
    let api = Arc::new(MemoryApi::new());
    api.fail_start(500, "boom");
    let mut c = controller_with(&api, TransportKind::Poll);

    c.start_analysis(A);
    assert_eq!(c.state(), JobState::Error);
    let failure = c.status().failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Start);
    assert!(failure.message.starts_with("Failed to start analysis"));

    api.push_start(StartAck::accepted().with_transport(TransportKind::Poll));
    c.start_analysis(A);
    assert_eq!(c.state(), JobState::Polling);
    assert_eq!(c.status().failure, None);
    assert_eq!(api.start_calls().len(), 2);
  }

  #[test]
  fn same_key_start_while_live_sends_nothing() {
    let api = Arc::new(MemoryApi::new());
    let _feed = api.stream_channel(A);
    let mut c = controller(&api);

    c.start_analysis(A);
    assert_eq!(c.state(), JobState::Starting);
    assert!(c.wait_for_event(Duration::from_secs(2)));
    assert_eq!(c.state(), JobState::Streaming);
    assert_eq!(c.status().message, "Analysis started.");

    let first = c.session_id();
    c.start_analysis("https://github.com/acme/alpha");
    assert_eq!(c.state(), JobState::Streaming);
    assert_eq!(c.session_id(), first);
    assert_eq!(api.stream_opens().len(), 1);
    assert!(api.start_calls().is_empty());
  }

  #[test]
  fn poll_start_that_names_the_stream_keeps_its_message() {
    let api = Arc::new(MemoryApi::new());
    let _feed = api.stream_channel(A);
    api.push_start(StartAck::accepted().with_transport(TransportKind::Stream).with_message("Queued."));
    let mut c = controller_with(&api, TransportKind::Poll);

    c.start_analysis(A);
    assert_eq!(c.state(), JobState::Streaming);
    assert!(c.wait_for_event(Duration::from_secs(2)));
    assert_eq!(c.state(), JobState::Streaming);
    assert_eq!(c.status().message, "Queued.");
    assert_eq!(c.transport(), Some(TransportKind::Stream));
  }

  #[test]
  fn stale_session_events_are_ignored() {
    let api = Arc::new(MemoryApi::new());
    let mut c = controller_with(&api, TransportKind::Poll);
    api.push_start(StartAck::accepted());
    api.push_status(
      &RepoKey::from_url(A),
      StatusReport { status: RemoteStatus::InProgress, progress: 5, error_message: None },
    );
    c.start_analysis(A);
    let live = c.session_id().unwrap();

    c.handle_event(SessionEvent {
      session: SessionId(live.0 + 40),
      event: TransportEvent::Result(result("x", "2024-01-01T00:00:00Z")),
    });
    c.handle_event(SessionEvent {
      session: SessionId(live.0 + 40),
      event: TransportEvent::Complete,
    });
    assert!(c.results().is_empty());
    assert_eq!(c.state(), JobState::Polling);
  }

  #[test]
  fn completion_refetches_snapshot_and_notifies() {
    let api = Arc::new(MemoryApi::new());
    let key = RepoKey::from_url(A);
    api.push_start(StartAck::accepted().with_transport(TransportKind::Poll));
    api.push_status(&key, StatusReport { status: RemoteStatus::Completed, progress: 100, error_message: None });
    api.set_snapshot(&key, vec![result("s1", "2024-02-01T00:00:00Z"), result("s2", "2024-03-01T00:00:00Z")]);

    let seen: Rc<RefCell<Vec<JobState>>> = Rc::default();
    let sink = Rc::clone(&seen);
    let mut c = controller_with(&api, TransportKind::Poll);
    c.subscribe(move |s| sink.borrow_mut().push(s.state));

    c.start_analysis(A);
    let end = c.run_until_settled(Some(Instant::now() + Duration::from_secs(5)));

    assert_eq!(end, JobState::Completed);
    assert_eq!(c.status().progress, 100);
    assert_eq!(c.status().message, "Analysis complete.");
    assert_eq!(c.results().len(), 2);
    assert_eq!(api.snapshot_calls(&key), 1);
    assert_eq!(c.session_id(), None);

    let seen = seen.borrow();
    assert_eq!(seen.first(), Some(&JobState::Starting));
    assert_eq!(seen.last(), Some(&JobState::Completed));
  }

  #[test]
  fn cancel_returns_to_idle_and_drops_session() {
    let api = Arc::new(MemoryApi::new());
    let _feed = api.stream_channel(A);
    let mut c = controller(&api);
    c.start_analysis(A);
    c.cancel();
    c.cancel();
    assert_eq!(c.state(), JobState::Idle);
    assert_eq!(c.session_id(), None);
    assert_eq!(c.status().message, "Analysis tracking cancelled.");
  }

  #[test]
  fn supplementary_queries_need_an_active_repository() {
    let api = Arc::new(MemoryApi::new());
    let mut c = controller(&api);
    assert!(c.load_commits(Some(10)).unwrap().is_empty());
    assert!(c.analyzed_timestamps().unwrap().is_empty());

    api.set_history(A, vec!["2024-01-01".into()]);
    api.set_commits(
      A,
      vec![
        FileChangeEvent { sha: "c1".into(), filename: "x".into(), author: "a".into(), timestamp: "t".into(), detected_units: Default::default() },
        FileChangeEvent { sha: "c1".into(), filename: "y".into(), author: "a".into(), timestamp: "t".into(), detected_units: Default::default() },
      ],
    );
    c.select_repository(A);
    assert_eq!(c.load_commits(None).unwrap().len(), 1);
    assert_eq!(c.commit_history().unwrap(), vec!["2024-01-01".to_string()]);
  }
}
