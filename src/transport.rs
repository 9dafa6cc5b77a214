// === Module Header (agents-tooling) START ===
// header: Parsed by scripts/check_module_headers.sh for purpose/role presence; keep keys on single-line entries.
// purpose: Own one progress transport (SSE stream or status polling) for one repository key and normalize it into TransportEvents
// role: transport/session
// inputs: AnalysisApi, repository URL and key, timing (poll interval, settle delay), event sink
// outputs: SessionEvent values (session id + TransportEvent) on an mpsc channel
// side_effects: Spawns one worker thread per session (stream workers run a private tokio runtime); network calls through AnalysisApi
// invariants:
// - a session emits at most one Failed and at most one Complete, and nothing after either
// - cancel() is idempotent; after it returns the worker emits nothing further and the stream connection is closed
// - a refused stream attaches by polling when the backend reports a running job, otherwise it is a start failure
// - stream messages for another repository key are dropped, never emitted
// - no local retry; a failure ends the session
// errors: Surfaced as TransportEvent::Failed (Transport or Backend kind)
// tie_breakers: contracts > orchestration > correctness > performance > minimal_diffs
// === Module Header END ===

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use clap::ValueEnum;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::backend::{AnalysisApi, StreamFrame};
use crate::error::{ApiError, JobFailure};
use crate::model::{AnalysisResult, RemoteStatus, StatusReport, StreamMessage};
use crate::repo_key::RepoKey;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
#[value(rename_all = "lowercase")]
pub enum TransportKind {
  Stream,
  Poll,
}

impl TransportKind {
  /// Reads the backend's transport hint; unknown names yield None.
  pub fn parse(raw: &str) -> Option<TransportKind> {
    match raw.trim().to_ascii_lowercase().as_str() {
      "stream" | "streaming" | "sse" => Some(TransportKind::Stream),
      "poll" | "polling" => Some(TransportKind::Poll),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy)]
pub struct TransportTiming {
  pub poll_interval: Duration,
  /// Pause between a 100% stream message and Complete, letting backend persistence settle.
  pub settle_delay: Duration,
}

impl Default for TransportTiming {
  fn default() -> Self {
    TransportTiming {
      poll_interval: Duration::from_secs(3),
      settle_delay: Duration::from_millis(500),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// Status message shown when a start request found a job already running.
pub const ALREADY_RUNNING: &str = "Analysis already running; attached to existing job.";

/// Longest `cancel()` waits for a stream worker to release its connection.
const RELEASE_WAIT: Duration = Duration::from_secs(2);

/// Normalized lifecycle event of either transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
  /// The job is being followed over `kind`; `message` replaces the status text when set.
  Attached { kind: TransportKind, message: Option<String> },
  Progress { progress: u8, message: String },
  Result(AnalysisResult),
  Failed(JobFailure),
  Complete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
  pub session: SessionId,
  pub event: TransportEvent,
}

pub fn progress_message(progress: u8) -> String {
  format!("Analysis in progress... {progress}%")
}

/// Translate one stream message for `key`.
///
/// Returns None for stale messages (no repository tag, or another repository's tag).
/// A message carrying `error` yields only the failure.
pub fn interpret_stream_message(key: &RepoKey, msg: &StreamMessage) -> Option<Vec<TransportEvent>> {
  let tagged = msg.repo_url.as_deref()?;

  if !key.matches_url(tagged) {
    return None;
  }

  if let Some(err) = &msg.error {
    return Some(vec![TransportEvent::Failed(JobFailure::backend(format!(
      "Analysis failed: {err}"
    )))]);
  }

  let mut events = Vec::new();

  if let Some(result) = &msg.file_data {
    let same_repo = result.repo_url.as_deref().map(|u| key.matches_url(u)).unwrap_or(true);

    if same_repo {
      events.push(TransportEvent::Result(result.clone()));
    }
  }

  if let Some(progress) = msg.progress {
    events.push(TransportEvent::Progress {
      progress,
      message: progress_message(progress),
    });
  }

  Some(events)
}

/// Translate one polling answer. The bool is true when polling must stop.
pub fn interpret_status(report: &StatusReport) -> (Vec<TransportEvent>, bool) {
  match report.status {
    RemoteStatus::Completed => (
      vec![
        TransportEvent::Progress {
          progress: 100,
          message: progress_message(100),
        },
        TransportEvent::Complete,
      ],
      true,
    ),
    RemoteStatus::Error => {
      let message = report
        .error_message
        .clone()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| "Analysis failed.".to_string());
      (vec![TransportEvent::Failed(JobFailure::backend(message))], true)
    }
    RemoteStatus::InProgress | RemoteStatus::Idle | RemoteStatus::Unknown => (
      vec![TransportEvent::Progress {
        progress: report.progress,
        message: progress_message(report.progress),
      }],
      false,
    ),
  }
}

/// Worker-side handle: stamps events with the session id and stops sending once cancelled.
struct Emitter {
  session: SessionId,
  cancelled: Arc<AtomicBool>,
  sink: mpsc::Sender<SessionEvent>,
}

impl Emitter {
  fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::SeqCst)
  }

  /// False once the session is cancelled or the controller is gone.
  fn emit(&self, event: TransportEvent) -> bool {
    if self.is_cancelled() {
      return false;
    }
    self
      .sink
      .send(SessionEvent {
        session: self.session,
        event,
      })
      .is_ok()
  }
}

/// Waits `delay` unless the session is cancelled first. True when the delay elapsed.
fn sleep_unless_cancelled(wake: &mpsc::Receiver<()>, delay: Duration) -> bool {
  matches!(wake.recv_timeout(delay), Err(RecvTimeoutError::Timeout))
}

/// Receivers the worker watches for cancellation.
struct WorkerSignals {
  /// Disconnects on cancel; parks the polling loop.
  wake: mpsc::Receiver<()>,
  /// Resolves on cancel; races the stream inside the worker's runtime.
  stop: oneshot::Receiver<()>,
  /// Dropped by a stream worker once its runtime, and with it the connection, is gone.
  released: Option<mpsc::Sender<()>>,
}

/// One live transport for one repository key.
pub struct TransportSession {
  id: SessionId,
  key: RepoKey,
  kind: TransportKind,
  cancelled: Arc<AtomicBool>,
  wake: Option<mpsc::Sender<()>>,
  stop: Option<oneshot::Sender<()>>,
  released: Option<mpsc::Receiver<()>>,
  worker: Option<JoinHandle<()>>,
}

impl TransportSession {
  /// Opens `kind` for `repo_url` and starts delivering events into `sink`.
  ///
  /// A stream session's request is itself a begin-analysis request.
  pub fn open(
    id: SessionId,
    kind: TransportKind,
    repo_url: &str,
    api: Arc<dyn AnalysisApi>,
    timing: TransportTiming,
    sink: mpsc::Sender<SessionEvent>,
  ) -> Self {
    let key = RepoKey::from_url(repo_url);
    let cancelled = Arc::new(AtomicBool::new(false));
    let (wake_tx, wake_rx) = mpsc::channel::<()>();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let (released_tx, released_rx) = match kind {
      TransportKind::Stream => {
        let (tx, rx) = mpsc::channel::<()>();
        (Some(tx), Some(rx))
      }
      TransportKind::Poll => (None, None),
    };

    let fallback = sink.clone();
    let emitter = Emitter {
      session: id,
      cancelled: Arc::clone(&cancelled),
      sink,
    };
    let signals = WorkerSignals {
      wake: wake_rx,
      stop: stop_rx,
      released: released_tx,
    };

    let url = repo_url.to_string();
    let worker_key = key.clone();
    let spawned = thread::Builder::new()
      .name(format!("transport-{}-{}", kind_label(kind), id.0))
      .spawn(move || match kind {
        TransportKind::Stream => run_stream(api.as_ref(), &url, &worker_key, &emitter, signals, timing),
        TransportKind::Poll => run_poll(api.as_ref(), &worker_key, &emitter, &signals.wake, timing),
      });

    let worker = match spawned {
      Ok(handle) => Some(handle),
      Err(err) => {
        tracing::error!(session = %id, error = %err, "failed to spawn transport worker");
        let _ = fallback.send(SessionEvent {
          session: id,
          event: TransportEvent::Failed(JobFailure::transport(format!("Could not start transport: {err}"))),
        });
        None
      }
    };

    tracing::debug!(session = %id, repo = %key, transport = kind_label(kind), "transport opened");

    TransportSession {
      id,
      key,
      kind,
      cancelled,
      wake: Some(wake_tx),
      stop: Some(stop_tx),
      released: released_rx,
      worker,
    }
  }

  pub fn id(&self) -> SessionId {
    self.id
  }

  pub fn key(&self) -> &RepoKey {
    &self.key
  }

  /// The transport the session was opened with.
  pub fn kind(&self) -> TransportKind {
    self.kind
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::SeqCst)
  }

  /// Stops the transport. Safe to call repeatedly and from any state.
  ///
  /// A worker parked between polls or in the settle delay wakes immediately. For a
  /// stream session this returns once the worker has dropped its connection.
  pub fn cancel(&mut self) {
    if self.cancelled.swap(true, Ordering::SeqCst) {
      return;
    }
    // dropping the senders disconnects both of the worker's wake-ups
    self.wake.take();
    self.stop.take();

    if let Some(released) = self.released.take() {
      if let Err(RecvTimeoutError::Timeout) = released.recv_timeout(RELEASE_WAIT) {
        tracing::warn!(session = %self.id, "stream worker did not release its connection in time");
      }
    }

    self.worker.take();
    tracing::debug!(session = %self.id, repo = %self.key, "transport cancelled");
  }
}

impl Drop for TransportSession {
  fn drop(&mut self) {
    self.cancel();
  }
}

fn kind_label(kind: TransportKind) -> &'static str {
  match kind {
    TransportKind::Stream => "stream",
    TransportKind::Poll => "poll",
  }
}

enum StreamEnd {
  Finished,
  Cancelled,
  Refused(ApiError),
}

fn run_stream(
  api: &dyn AnalysisApi,
  repo_url: &str,
  key: &RepoKey,
  emitter: &Emitter,
  signals: WorkerSignals,
  timing: TransportTiming,
) {
  let WorkerSignals { wake, stop, released } = signals;

  let end = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
    Ok(runtime) => {
      let end = runtime.block_on(async {
        tokio::select! {
          _ = stop => StreamEnd::Cancelled,
          end = follow_stream(api, repo_url, key, emitter, timing) => end,
        }
      });
      // shutting the runtime down drops the connection task with its socket
      drop(runtime);
      end
    }
    Err(err) => {
      emitter.emit(TransportEvent::Failed(JobFailure::transport(format!(
        "Could not start transport: {err}"
      ))));
      StreamEnd::Finished
    }
  };
  drop(released);

  match end {
    StreamEnd::Refused(refusal) => attach_after_refusal(api, key, emitter, &wake, timing, refusal),
    StreamEnd::Cancelled => tracing::trace!(repo = %key, "stream worker stopped"),
    StreamEnd::Finished => {}
  }
}

async fn follow_stream(
  api: &dyn AnalysisApi,
  repo_url: &str,
  key: &RepoKey,
  emitter: &Emitter,
  timing: TransportTiming,
) -> StreamEnd {
  let mut frames = match api.open_stream(repo_url) {
    Ok(frames) => frames,
    Err(err) => return refused_or_failed(emitter, err),
  };

  let mut opened = false;

  while let Some(item) = frames.next().await {
    if emitter.is_cancelled() {
      return StreamEnd::Cancelled;
    }

    let frame = match item {
      Ok(frame) => frame,
      Err(err) if !opened => return refused_or_failed(emitter, err),
      Err(err) => {
        emitter.emit(TransportEvent::Failed(JobFailure::transport(format!(
          "Analysis stream failed: {err}"
        ))));
        return StreamEnd::Finished;
      }
    };

    if !opened {
      opened = true;
      tracing::debug!(repo = %key, "analysis stream open");
      if !emitter.emit(TransportEvent::Attached {
        kind: TransportKind::Stream,
        message: None,
      }) {
        return StreamEnd::Cancelled;
      }
    }

    let msg = match frame {
      StreamFrame::Opened => continue,
      StreamFrame::Message(msg) => msg,
    };

    let Some(events) = interpret_stream_message(key, &msg) else {
      tracing::trace!(repo = %key, tagged = ?msg.repo_url, "dropping stream message for another repository");
      continue;
    };

    for event in events {
      let finished = matches!(event, TransportEvent::Progress { progress: 100, .. });
      let failed = matches!(event, TransportEvent::Failed(_));

      if !emitter.emit(event) || failed {
        return StreamEnd::Finished;
      }

      if finished {
        tokio::time::sleep(timing.settle_delay).await;
        emitter.emit(TransportEvent::Complete);
        return StreamEnd::Finished;
      }
    }
  }

  emitter.emit(TransportEvent::Failed(JobFailure::transport(
    "Analysis stream closed before the analysis finished.",
  )));
  StreamEnd::Finished
}

/// A stream that never opened: a refusal may still mean the job runs, anything else failed the start.
fn refused_or_failed(emitter: &Emitter, err: ApiError) -> StreamEnd {
  if let ApiError::Refused { .. } = err {
    return StreamEnd::Refused(err);
  }

  emitter.emit(TransportEvent::Failed(JobFailure::start(format!(
    "Failed to start analysis: {err}"
  ))));
  StreamEnd::Finished
}

/// Follows a job whose stream request was refused, when the backend reports it running.
fn attach_after_refusal(
  api: &dyn AnalysisApi,
  key: &RepoKey,
  emitter: &Emitter,
  wake: &mpsc::Receiver<()>,
  timing: TransportTiming,
  refusal: ApiError,
) {
  let report = match api.analysis_status(key) {
    Ok(report) => report,
    Err(err) => {
      tracing::warn!(repo = %key, error = %err, "status check after refused stream failed");
      emitter.emit(TransportEvent::Failed(JobFailure::start(format!(
        "Failed to start analysis: {refusal}"
      ))));
      return;
    }
  };

  if !matches!(report.status, RemoteStatus::InProgress | RemoteStatus::Completed) {
    emitter.emit(TransportEvent::Failed(JobFailure::start(format!(
      "Failed to start analysis: {refusal}"
    ))));
    return;
  }

  tracing::info!(repo = %key, reason = %refusal, "stream refused; attaching to the running job by polling");

  let attached = emitter.emit(TransportEvent::Attached {
    kind: TransportKind::Poll,
    message: Some(ALREADY_RUNNING.to_string()),
  }) && emitter.emit(TransportEvent::Progress {
    progress: report.progress,
    message: progress_message(report.progress),
  });

  if attached {
    run_poll(api, key, emitter, wake, timing);
  }
}

fn run_poll(
  api: &dyn AnalysisApi,
  key: &RepoKey,
  emitter: &Emitter,
  wake: &mpsc::Receiver<()>,
  timing: TransportTiming,
) {
  loop {
    if !sleep_unless_cancelled(wake, timing.poll_interval) {
      return;
    }

    let report = match api.analysis_status(key) {
      Ok(r) => r,
      Err(err) => {
        emitter.emit(TransportEvent::Failed(JobFailure::transport(format!(
          "Failed to query analysis status: {err}"
        ))));
        return;
      }
    };

    let (events, stop) = interpret_status(&report);

    for event in events {
      if !emitter.emit(event) {
        return;
      }
    }

    if stop {
      return;
    }
  }
}
