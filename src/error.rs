use serde::Serialize;
use thiserror::Error;

/// Failure talking to the analysis backend.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("request to {endpoint} failed: {message}")]
  Network { endpoint: String, message: String },

  #[error("{endpoint} answered HTTP {status}: {body}")]
  Status { endpoint: String, status: u16, body: String },

  /// The event stream was answered with a non-success response.
  #[error("{endpoint} refused the event stream: {message}")]
  Refused { endpoint: String, message: String },

  #[error("malformed response from {endpoint}: {message}")]
  Decode { endpoint: String, message: String },

  #[error("reading {endpoint}: {source}")]
  Io {
    endpoint: String,
    #[source]
    source: std::io::Error,
  },
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
  pub fn endpoint(&self) -> &str {
    match self {
      ApiError::Network { endpoint, .. }
      | ApiError::Status { endpoint, .. }
      | ApiError::Refused { endpoint, .. }
      | ApiError::Decode { endpoint, .. }
      | ApiError::Io { endpoint, .. } => endpoint,
    }
  }
}

/// Which step of a job attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
  /// The begin-analysis request itself failed.
  Start,
  /// The stream or a polling tick failed.
  Transport,
  /// The backend reported the job as failed.
  Backend,
}

/// Terminal failure of one job attempt; the message is shown to the user verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{message}")]
pub struct JobFailure {
  pub kind: FailureKind,
  pub message: String,
}

impl JobFailure {
  pub fn start(message: impl Into<String>) -> Self {
    JobFailure { kind: FailureKind::Start, message: message.into() }
  }

  pub fn transport(message: impl Into<String>) -> Self {
    JobFailure { kind: FailureKind::Transport, message: message.into() }
  }

  pub fn backend(message: impl Into<String>) -> Self {
    JobFailure { kind: FailureKind::Backend, message: message.into() }
  }
}
