// === Module Header (agents-tooling) START ===
// header: Parsed by scripts/check_module_headers.sh for purpose/role presence; keep keys on single-line entries.
// purpose: Consume the /analyze server-sent event stream through eventsource-client and decode its data payloads
// role: backend/sse
// inputs: a built eventsource Client for one /analyze request
// outputs: StreamFrame items (Opened, then decoded StreamMessages) on a bounded channel
// side_effects: Spawns one task on the current tokio runtime; it owns the HTTP connection
// invariants:
// - the connection lives exactly as long as the feed task; dropping the EventFeed aborts it
// - at most one error is forwarded and nothing after it
// - a non-success response before the stream opens surfaces as ApiError::Refused
// errors: ApiError (Refused, Network, Decode) carrying the endpoint
// tie_breakers: contracts > orchestration > correctness > performance > minimal_diffs
// === Module Header END ===

use std::pin::Pin;
use std::task::{Context, Poll};

use eventsource_client::{Client, SSE};
use futures::stream::Stream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{ApiError, ApiResult};
use crate::model::StreamMessage;

use super::StreamFrame;

/// Frames of one event stream, fed by a task that owns the connection.
pub struct EventFeed {
  receiver: mpsc::Receiver<ApiResult<StreamFrame>>,
  handle: JoinHandle<()>,
}

impl EventFeed {
  /// Starts reading `client`'s stream. Must be called from within a tokio runtime.
  pub fn spawn<C>(endpoint: &'static str, client: C) -> Self
  where
    C: Client + 'static,
  {
    let (tx, rx) = mpsc::channel(32);
    let handle = tokio::spawn(async move {
      let mut events = client.stream();

      while let Some(event) = events.next().await {
        let frame = match event {
          Ok(SSE::Connected(_)) => Ok(StreamFrame::Opened),
          Ok(SSE::Event(ev)) => {
            // unnamed events arrive as "message"
            if !ev.event_type.is_empty() && ev.event_type != "message" {
              continue;
            }
            decode_message(endpoint, &ev.data).map(StreamFrame::Message)
          }
          Ok(SSE::Comment(_)) => continue,
          Err(err) => Err(map_sse_error(endpoint, err)),
        };

        let last = frame.is_err();
        if tx.send(frame).await.is_err() || last {
          break;
        }
      }
    });

    EventFeed { receiver: rx, handle }
  }
}

impl Stream for EventFeed {
  type Item = ApiResult<StreamFrame>;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.receiver.poll_recv(cx)
  }
}

impl Drop for EventFeed {
  fn drop(&mut self) {
    self.handle.abort();
  }
}

/// Decodes one `data:` payload.
pub fn decode_message(endpoint: &str, payload: &str) -> ApiResult<StreamMessage> {
  serde_json::from_str(payload).map_err(|e| ApiError::Decode {
    endpoint: endpoint.to_string(),
    message: format!("{e} in {payload:?}"),
  })
}

fn map_sse_error(endpoint: &str, err: eventsource_client::Error) -> ApiError {
  if matches!(err, eventsource_client::Error::UnexpectedResponse(..)) {
    return ApiError::Refused {
      endpoint: endpoint.to_string(),
      message: err.to_string(),
    };
  }

  ApiError::Network {
    endpoint: endpoint.to_string(),
    message: err.to_string(),
  }
}
