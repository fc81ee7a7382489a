//! Test harness for the compat adapters: a scripted mock upstream speaking
//! `/chat/completions`, plus SSE frame parsing and stream-invariant checks.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::post,
};
use serde_json::Value;
use tokio::net::TcpListener;

/// One canned upstream reply, consumed in FIFO order.
pub enum UpstreamScript {
    /// SSE body: each entry becomes one line, joined with `\n` plus a
    /// trailing newline, served as `text/event-stream`.
    Sse(Vec<String>),
    /// JSON body at the given status.
    Json { status: u16, body: Value },
    /// Plain-text body at the given status.
    Text { status: u16, body: String },
    /// Raw body with an explicit content type (NDJSON, broken payloads, …).
    Raw { body: String, content_type: &'static str },
}

#[derive(Clone)]
struct MockState {
    scripts: Arc<Mutex<VecDeque<UpstreamScript>>>,
    requests: Arc<Mutex<Vec<Value>>>,
}

/// Scripted OpenAI-compatible gateway bound to an ephemeral loopback port.
pub struct MockUpstream {
    base_url: String,
    state: MockState,
}

impl MockUpstream {
    pub async fn start(scripts: Vec<UpstreamScript>) -> Self {
        let state = MockState {
            scripts: Arc::new(Mutex::new(scripts.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
        };
        let router = Router::new()
            .route("/chat/completions", post(handle_chat_completions))
            .with_state(state.clone());
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Request bodies received so far, in order.
    pub fn requests(&self) -> Vec<Value> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.lock().unwrap().len()
    }
}

async fn handle_chat_completions(State(state): State<MockState>, body: String) -> Response {
    let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    state.requests.lock().unwrap().push(parsed);

    let script = state.scripts.lock().unwrap().pop_front();
    match script {
        None => (StatusCode::INTERNAL_SERVER_ERROR, "mock upstream exhausted").into_response(),
        Some(UpstreamScript::Sse(lines)) => {
            let mut body = lines.join("\n");
            body.push('\n');
            Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/event-stream")
                .body(Body::from(body))
                .unwrap()
        }
        Some(UpstreamScript::Json { status, body }) => Response::builder()
            .status(StatusCode::from_u16(status).unwrap())
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        Some(UpstreamScript::Text { status, body }) => Response::builder()
            .status(StatusCode::from_u16(status).unwrap())
            .header(CONTENT_TYPE, "text/plain")
            .body(Body::from(body))
            .unwrap(),
        Some(UpstreamScript::Raw { body, content_type }) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap(),
    }
}

/// One parsed SSE frame from an adapter response body.
#[derive(Debug, Clone)]
pub struct SseFrame {
    /// Value of the `event:` line, when present (Anthropic dialect).
    pub event: Option<String>,
    /// Raw `data:` payload (may be `[DONE]`).
    pub data: String,
}

impl SseFrame {
    /// The frame's JSON payload; panics on `[DONE]` or non-JSON data.
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.data)
            .unwrap_or_else(|e| panic!("frame data is not JSON ({e}): {}", self.data))
    }

    /// The `type` field of the JSON payload, or the raw data for sentinels.
    pub fn event_type(&self) -> String {
        if self.data == "[DONE]" {
            return "[DONE]".to_string();
        }
        self.json()["type"].as_str().unwrap_or("").to_string()
    }
}

/// Splits an SSE body into frames (blank-line separated).
pub fn parse_sse_frames(body: &str) -> Vec<SseFrame> {
    let body = body.replace("\r\n", "\n");
    let mut frames = Vec::new();
    for raw_frame in body.split("\n\n") {
        let mut event = None;
        let mut data_lines = Vec::new();
        for line in raw_frame.lines() {
            if let Some(value) = line.strip_prefix("event:") {
                event = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                data_lines.push(value.trim().to_string());
            }
        }
        if event.is_none() && data_lines.is_empty() {
            continue;
        }
        frames.push(SseFrame {
            event,
            data: data_lines.join("\n"),
        });
    }
    frames
}

/// Event-type sequence of a frame list, convenient for order assertions.
pub fn event_types(frames: &[SseFrame]) -> Vec<String> {
    frames.iter().map(SseFrame::event_type).collect()
}

/// Block-closure invariant for the Responses dialect: every
/// `output_item.added` index sees exactly one `output_item.done`, first-seen
/// indices are strictly increasing, and the terminal events come last.
pub fn assert_responses_stream_invariants(frames: &[SseFrame]) {
    let mut added: Vec<i64> = Vec::new();
    let mut done: Vec<i64> = Vec::new();
    let mut completed_at = None;
    let mut last_close_at = None;

    for (pos, frame) in frames.iter().enumerate() {
        match frame.event_type().as_str() {
            "response.output_item.added" => {
                let index = frame.json()["output_index"].as_i64().unwrap();
                if !added.contains(&index) {
                    added.push(index);
                }
            }
            "response.output_item.done" => {
                let index = frame.json()["output_index"].as_i64().unwrap();
                done.push(index);
                last_close_at = Some(pos);
            }
            "response.completed" => completed_at = Some(pos),
            _ => {}
        }
    }

    for index in &added {
        let closes = done.iter().filter(|d| *d == index).count();
        assert_eq!(closes, 1, "output_index {index} closed {closes} times");
    }
    for pair in added.windows(2) {
        assert!(pair[0] < pair[1], "output indices not increasing: {added:?}");
    }
    let completed_at = completed_at.expect("stream must emit response.completed");
    if let Some(last_close_at) = last_close_at {
        assert!(completed_at > last_close_at, "response.completed before a block close");
    }
    assert_eq!(
        frames.last().map(|f| f.data.as_str()),
        Some("[DONE]"),
        "stream must terminate with [DONE]"
    );
}

/// Block-closure invariant for the Anthropic dialect: every
/// `content_block_start` index sees exactly one `content_block_stop`, and
/// `message_stop` is last.
pub fn assert_anthropic_stream_invariants(frames: &[SseFrame]) {
    let mut started: Vec<i64> = Vec::new();
    let mut stopped: Vec<i64> = Vec::new();

    for frame in frames {
        match frame.event_type().as_str() {
            "content_block_start" => {
                started.push(frame.json()["index"].as_i64().unwrap());
            }
            "content_block_stop" => {
                stopped.push(frame.json()["index"].as_i64().unwrap());
            }
            _ => {}
        }
    }
    for index in &started {
        let stops = stopped.iter().filter(|s| *s == index).count();
        assert_eq!(stops, 1, "block index {index} stopped {stops} times");
    }
    for pair in started.windows(2) {
        assert!(pair[0] < pair[1], "block indices not increasing: {started:?}");
    }
    assert_eq!(
        frames.last().map(|f| f.event_type()),
        Some("message_stop".to_string()),
        "stream must terminate with message_stop"
    );
}
