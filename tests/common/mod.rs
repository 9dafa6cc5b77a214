#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::Duration;

use analysis_tracker::controller::ControllerSettings;
use analysis_tracker::model::{AnalysisResult, FileChangeEvent, StreamMessage};
use analysis_tracker::transport::{TransportKind, TransportTiming};
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize `tracing` once, honoring `RUST_LOG` and writing via the test writer.
pub fn init_tracing() {
  static INIT: Once = Once::new();
  INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
  });
}

pub const ALPHA: &str = "https://github.com/acme/alpha.git";
pub const BETA: &str = "https://github.com/acme/beta.git";

pub fn settings(kind: TransportKind) -> ControllerSettings {
  ControllerSettings {
    transport: kind,
    timing: TransportTiming {
      poll_interval: Duration::from_millis(5),
      settle_delay: Duration::from_millis(5),
    },
  }
}

pub fn change(sha: &str, filename: &str, ts: &str) -> FileChangeEvent {
  FileChangeEvent {
    sha: sha.into(),
    filename: filename.into(),
    author: "dev".into(),
    timestamp: ts.into(),
    detected_units: [("K1".to_string(), 1.0)].into_iter().collect(),
  }
}

pub fn result(sha: &str, filename: &str, ts: &str) -> AnalysisResult {
  AnalysisResult::from(change(sha, filename, ts))
}

pub fn progress(repo_url: &str, value: u8) -> StreamMessage {
  StreamMessage {
    repo_url: Some(repo_url.into()),
    progress: Some(value),
    ..Default::default()
  }
}

pub fn with_file(repo_url: &str, value: u8, file: AnalysisResult) -> StreamMessage {
  StreamMessage {
    file_data: Some(AnalysisResult {
      repo_url: Some(repo_url.into()),
      ..file
    }),
    ..progress(repo_url, value)
  }
}

/// One request as seen by [`MockServer`].
#[derive(Debug, Clone)]
pub struct Request {
  pub method: String,
  pub path: String,
  pub query: String,
  pub accept: String,
  pub body: String,
}

impl Request {
  pub fn wants_stream(&self) -> bool {
    self.accept.contains("text/event-stream")
  }
}

pub struct Reply {
  pub status: u16,
  pub content_type: &'static str,
  pub body: String,
}

impl Reply {
  pub fn json(status: u16, body: serde_json::Value) -> Self {
    Reply {
      status,
      content_type: "application/json",
      body: body.to_string(),
    }
  }

  /// Server-sent events, one `data:` frame per message.
  pub fn events(messages: &[serde_json::Value]) -> Self {
    let body = messages.iter().map(|m| format!("data: {}\n\n", m)).collect::<String>();
    Reply {
      status: 200,
      content_type: "text/event-stream",
      body,
    }
  }

  pub fn not_found() -> Self {
    Reply {
      status: 404,
      content_type: "text/plain",
      body: "not found".into(),
    }
  }
}

/// Minimal HTTP/1.1 responder on 127.0.0.1 for end-to-end CLI runs.
///
/// Every connection is answered once and closed.
pub struct MockServer {
  pub url: String,
  requests: Arc<Mutex<Vec<Request>>>,
}

impl MockServer {
  pub fn start<F>(handler: F) -> Self
  where
    F: Fn(&Request) -> Reply + Send + Sync + 'static,
  {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let requests: Arc<Mutex<Vec<Request>>> = Arc::default();
    let handler = Arc::new(handler);

    let log = Arc::clone(&requests);
    thread::spawn(move || {
      for stream in listener.incoming().flatten() {
        let handler = Arc::clone(&handler);
        let log = Arc::clone(&log);
        thread::spawn(move || {
          if let Some(req) = read_request(&stream) {
            let reply = handler(&req);
            log.lock().unwrap().push(req);
            write_reply(stream, reply);
          }
        });
      }
    });

    MockServer { url, requests }
  }

  pub fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }

  pub fn hits(&self, path: &str) -> usize {
    self.requests().iter().filter(|r| r.path == path).count()
  }
}

fn read_request(stream: &TcpStream) -> Option<Request> {
  let mut reader = BufReader::new(stream.try_clone().ok()?);
  let mut line = String::new();
  reader.read_line(&mut line).ok()?;

  let mut parts = line.split_whitespace();
  let method = parts.next()?.to_string();
  let target = parts.next()?.to_string();
  let (path, query) = match target.split_once('?') {
    Some((p, q)) => (p.to_string(), q.to_string()),
    None => (target, String::new()),
  };

  let mut accept = String::new();
  let mut content_length = 0usize;
  loop {
    let mut header = String::new();
    if reader.read_line(&mut header).ok()? == 0 {
      break;
    }
    let header = header.trim_end();
    if header.is_empty() {
      break;
    }
    if let Some((name, value)) = header.split_once(':') {
      match name.trim().to_ascii_lowercase().as_str() {
        "accept" => accept = value.trim().to_string(),
        "content-length" => content_length = value.trim().parse().unwrap_or(0),
        _ => {}
      }
    }
  }

  let mut body = vec![0u8; content_length];
  reader.read_exact(&mut body).ok()?;

  Some(Request {
    method,
    path,
    query,
    accept,
    body: String::from_utf8_lossy(&body).into_owned(),
  })
}

fn write_reply(mut stream: TcpStream, reply: Reply) {
  let reason = match reply.status {
    200 => "OK",
    202 => "Accepted",
    404 => "Not Found",
    409 => "Conflict",
    _ => "Status",
  };
  let head = format!(
    "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
    reply.status,
    reason,
    reply.content_type,
    reply.body.len()
  );
  let _ = stream.write_all(head.as_bytes());
  let _ = stream.write_all(reply.body.as_bytes());
  let _ = stream.flush();
}
