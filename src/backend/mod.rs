// === Module Header (agents-tooling) START ===
// header: Parsed by scripts/check_module_headers.sh for purpose/role presence; keep keys on single-line entries.
// purpose: Backend contract (start, stream, status, snapshot, commits, timestamps) behind a trait seam with an HTTP implementation
// role: backend/api
// inputs: base URL, per-request timeout; repository URLs and keys
// outputs: typed payloads from the analysis backend; SSE frame streams
// side_effects: Network calls to the configured analysis backend
// invariants:
// - 2xx and 409 on /analyze are both success paths (accepted / already running)
// - non-streaming calls honour the request timeout; the stream connection has no read timeout
// - the stream request is itself a begin-analysis request; a refused stream is ApiError::Refused
// - a null /analyzedb body is an empty snapshot
// errors: ApiError (Network, Status, Decode, Io) with the endpoint path attached
// tie_breakers: contracts > orchestration > correctness > performance > minimal_diffs
// === Module Header END ===

#[cfg(any(test, feature = "testutil"))]
pub mod memory;
pub mod sse;

use std::time::Duration;

use eventsource_client::{ClientBuilder, ReconnectOptions};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::model::{AnalysisResult, CommitHistory, FileChangeEvent, StartBody, StatusReport, StreamMessage};
use crate::repo_key::RepoKey;
use crate::transport::TransportKind;

use self::sse::EventFeed;

/// How the backend answered a begin-analysis request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartDisposition {
  /// 202: a new job was created.
  Accepted,
  /// 409: a job for this repository is already running.
  AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartAck {
  pub disposition: StartDisposition,
  pub message: Option<String>,
  /// Transport the backend asks us to use; None leaves the choice to configuration.
  pub transport: Option<TransportKind>,
}

impl StartAck {
  pub fn accepted() -> Self {
    StartAck {
      disposition: StartDisposition::Accepted,
      message: None,
      transport: None,
    }
  }

  pub fn already_running() -> Self {
    StartAck {
      disposition: StartDisposition::AlreadyRunning,
      message: None,
      transport: None,
    }
  }

  pub fn with_transport(mut self, kind: TransportKind) -> Self {
    self.transport = Some(kind);
    self
  }

  pub fn with_message(mut self, message: impl Into<String>) -> Self {
    self.message = Some(message.into());
    self
  }

  fn from_body(disposition: StartDisposition, body: &str) -> Self {
    let parsed: StartBody = serde_json::from_str(body).unwrap_or_default();

    StartAck {
      disposition,
      message: parsed.message.filter(|m| !m.trim().is_empty()),
      transport: parsed.transport.as_deref().and_then(TransportKind::parse),
    }
  }
}

/// One item of an analysis event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
  /// The backend accepted the request and the event stream is open.
  Opened,
  Message(StreamMessage),
}

/// Frames of one analysis stream, in arrival order. Dropping it closes the connection.
pub type MessageStream = BoxStream<'static, ApiResult<StreamFrame>>;

/// The analysis backend, as seen by the controller and its transports.
pub trait AnalysisApi: Send + Sync {
  /// `POST /commits`: flat per-file rows for the repository's history.
  fn fetch_commits(&self, repo_url: &str, limit: Option<u32>) -> ApiResult<Vec<FileChangeEvent>>;
  /// `GET /analyze`: begin (or discover) the analysis job.
  fn begin_analysis(&self, repo_url: &str) -> ApiResult<StartAck>;
  /// `GET /analyze` as an event stream; the request also begins the job.
  ///
  /// Called from within a tokio runtime. A non-success answer yields
  /// [`ApiError::Refused`], either here or as the first frame.
  fn open_stream(&self, repo_url: &str) -> ApiResult<MessageStream>;
  /// `GET /analysis_status`.
  fn analysis_status(&self, key: &RepoKey) -> ApiResult<StatusReport>;
  /// `GET /analyzedb`: authoritative stored results.
  fn fetch_snapshot(&self, key: &RepoKey) -> ApiResult<Vec<AnalysisResult>>;
  /// `GET /timestamps`: timestamps of already analyzed commits.
  fn analyzed_timestamps(&self, key: &RepoKey) -> ApiResult<Vec<String>>;
  /// `GET /historytime`: commit dates of the whole repository.
  fn commit_history(&self, repo_url: &str) -> ApiResult<Vec<String>>;
}

/// ureq-backed implementation of [`AnalysisApi`]; the event stream goes through eventsource-client.
pub struct HttpApi {
  base_url: String,
  agent: ureq::Agent,
}

impl HttpApi {
  pub fn new(base_url: &str, request_timeout: Duration) -> Self {
    let agent = ureq::AgentBuilder::new()
      .timeout(request_timeout)
      .user_agent("analysis-tracker")
      .build();

    HttpApi {
      base_url: base_url.trim_end_matches('/').to_string(),
      agent,
    }
  }

  pub fn base_url(&self) -> &str {
    &self.base_url
  }

  fn url(&self, path: &str) -> String {
    format!("{}{}", self.base_url, path)
  }

  /// Absolute URL for `path` with `query` percent-encoded.
  fn url_with_query(&self, path: &str, query: &[(&str, &str)]) -> ApiResult<url::Url> {
    let mut url = url::Url::parse(&self.url(path)).map_err(|e| ApiError::Network {
      endpoint: path.to_string(),
      message: format!("invalid URL: {e}"),
    })?;
    url.query_pairs_mut().extend_pairs(query);
    Ok(url)
  }

  fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> ApiResult<T> {
    let mut req = self.agent.get(&self.url(path)).set("Accept", "application/json");

    for (k, v) in query {
      req = req.query(k, v);
    }

    let resp = req.call().map_err(|e| map_ureq_error(path, e))?;
    decode_body(path, resp)
  }
}

fn map_ureq_error(endpoint: &str, err: ureq::Error) -> ApiError {
  match err {
    ureq::Error::Status(status, resp) => ApiError::Status {
      endpoint: endpoint.to_string(),
      status,
      body: resp.into_string().unwrap_or_default(),
    },
    ureq::Error::Transport(t) => ApiError::Network {
      endpoint: endpoint.to_string(),
      message: t.to_string(),
    },
  }
}

fn decode_body<T: DeserializeOwned>(endpoint: &str, resp: ureq::Response) -> ApiResult<T> {
  let text = resp.into_string().map_err(|source| ApiError::Io {
    endpoint: endpoint.to_string(),
    source,
  })?;

  serde_json::from_str(&text).map_err(|e| ApiError::Decode {
    endpoint: endpoint.to_string(),
    message: e.to_string(),
  })
}

impl AnalysisApi for HttpApi {
  fn fetch_commits(&self, repo_url: &str, limit: Option<u32>) -> ApiResult<Vec<FileChangeEvent>> {
    let path = "/commits";
    let resp = self
      .agent
      .post(&self.url(path))
      .set("Accept", "application/json")
      .send_json(serde_json::json!({ "repo_url": repo_url, "limit": limit }))
      .map_err(|e| map_ureq_error(path, e))?;

    let rows: Option<Vec<FileChangeEvent>> = decode_body(path, resp)?;
    Ok(rows.unwrap_or_default())
  }

  fn begin_analysis(&self, repo_url: &str) -> ApiResult<StartAck> {
    let path = "/analyze";
    let resp = self
      .agent
      .get(&self.url(path))
      .query("repo_url", repo_url)
      .set("Accept", "application/json")
      .call();

    match resp {
      Ok(r) => {
        let body = r.into_string().unwrap_or_default();
        Ok(StartAck::from_body(StartDisposition::Accepted, &body))
      }
      Err(ureq::Error::Status(409, r)) => {
        let body = r.into_string().unwrap_or_default();
        Ok(StartAck::from_body(StartDisposition::AlreadyRunning, &body))
      }
      Err(e) => Err(map_ureq_error(path, e)),
    }
  }

  fn open_stream(&self, repo_url: &str) -> ApiResult<MessageStream> {
    let path = "/analyze";
    let url = self.url_with_query(path, &[("repo_url", repo_url)])?;

    // No read timeout and no reconnect: the stream may sit idle between progress
    // messages, and a reconnect would be a second begin-analysis request.
    let client = ClientBuilder::for_url(url.as_str())
      .and_then(|b| b.header("accept", "text/event-stream"))
      .and_then(|b| b.header("cache-control", "no-cache"))
      .map_err(|e| ApiError::Network {
        endpoint: path.to_string(),
        message: e.to_string(),
      })?
      .reconnect(ReconnectOptions::reconnect(false).build())
      .build();

    Ok(EventFeed::spawn(path, client).boxed())
  }

  fn analysis_status(&self, key: &RepoKey) -> ApiResult<StatusReport> {
    self.get_json("/analysis_status", &[("repo_name", key.as_str())])
  }

  fn fetch_snapshot(&self, key: &RepoKey) -> ApiResult<Vec<AnalysisResult>> {
    let rows: Option<Vec<AnalysisResult>> = self.get_json("/analyzedb", &[("repo_name", key.as_str())])?;
    Ok(rows.unwrap_or_default())
  }

  fn analyzed_timestamps(&self, key: &RepoKey) -> ApiResult<Vec<String>> {
    let rows: Option<Vec<String>> = self.get_json("/timestamps", &[("repo_name", key.as_str())])?;
    Ok(rows.unwrap_or_default())
  }

  fn commit_history(&self, repo_url: &str) -> ApiResult<Vec<String>> {
    let history: CommitHistory = self.get_json("/historytime", &[("repo_url", repo_url)])?;
    Ok(history.commit_dates)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn start_body_names_transport_and_message() {
    let ack = StartAck::from_body(
      StartDisposition::AlreadyRunning,
      r#"{"message": "Analysis already in progress", "transport": "poll"}"#,
    );
    assert_eq!(ack.disposition, StartDisposition::AlreadyRunning);
    assert_eq!(ack.transport, Some(TransportKind::Poll));
    assert_eq!(ack.message.as_deref(), Some("Analysis already in progress"));
  }

  #[test]
  fn start_body_tolerates_empty_or_plain_text() {
    let ack = StartAck::from_body(StartDisposition::Accepted, "");
    assert_eq!(ack, StartAck::accepted());
    let ack = StartAck::from_body(StartDisposition::Accepted, "Accepted");
    assert_eq!(ack.transport, None);
  }

  #[test]
  fn base_url_trailing_slash_is_trimmed() {
    let api = HttpApi::new("http://localhost:5000/", Duration::from_secs(1));
    assert_eq!(api.base_url(), "http://localhost:5000");
    assert_eq!(api.url("/analyze"), "http://localhost:5000/analyze");
  }

  #[test]
  fn stream_url_encodes_the_repository() {
    let api = HttpApi::new("http://localhost:5000", Duration::from_secs(1));
    let url = api
      .url_with_query("/analyze", &[("repo_url", "https://github.com/acme/widgets.git")])
      .unwrap();
    assert_eq!(
      url.as_str(),
      "http://localhost:5000/analyze?repo_url=https%3A%2F%2Fgithub.com%2Facme%2Fwidgets.git"
    );
  }

  #[test]
  fn unreachable_backend_is_a_network_error() {
    let api = HttpApi::new("http://127.0.0.1:9", Duration::from_millis(500));
    let err = api.begin_analysis("https://github.com/acme/widgets.git").unwrap_err();
    assert!(matches!(err, ApiError::Network { .. }), "unexpected error: {err}");
    assert_eq!(err.endpoint(), "/analyze");
  }
}
