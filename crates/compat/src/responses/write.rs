//! Response writers for the Responses dialect: the non-stream JSON builder
//! and the streaming state machine that re-encodes upstream Chat chunks as
//! `response.*` SSE events.

use std::{collections::HashMap, convert::Infallible, sync::Arc};

use axum::{
    Json,
    http::header::{CACHE_CONTROL, HeaderValue},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
};
use futures::{SinkExt, StreamExt, channel::mpsc};
use serde_json::{Value, json};

use crate::{
    chat::{
        extract_delta, extract_full_text, extract_reasoning_delta, extract_tool_call_deltas,
        extract_tool_calls, now_nanos, str_field,
    },
    decode::{LOG_PREVIEW_BYTES, truncate_for_log},
    error::CompatError,
    logfile::CompatLogger,
    sse::{ClientGone, LineScanner, StreamLine, classify_line},
    usage::{chat_usage_to_responses_usage, format_usage_for_log, merge_responses_usage},
};

/// Builds the non-stream Responses object from an upstream Chat response.
pub(super) async fn non_stream_response(logger: &CompatLogger, upstream: reqwest::Response) -> Response {
    let raw = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(_) => {
            logger.warn("failed to read upstream non-stream body");
            return CompatError::InvalidUpstreamResponse.into_response();
        }
    };
    logger.log(format!(
        "upstream non-stream raw body={}",
        truncate_for_log(&String::from_utf8_lossy(&raw), LOG_PREVIEW_BYTES)
    ));
    let Ok(Value::Object(chat_resp)) = serde_json::from_slice::<Value>(&raw) else {
        logger.warn("invalid upstream non-stream JSON");
        return CompatError::InvalidUpstreamResponse.into_response();
    };

    let text = extract_full_text(&chat_resp);
    logger.log(format!("non-stream extracted text length={}", text.len()));
    let mut model = str_field(&chat_resp, "model").to_string();
    if model.is_empty() {
        model = "unknown".to_string();
    }
    let mut id = str_field(&chat_resp, "id").to_string();
    if id.is_empty() {
        id = format!("resp_{}", now_nanos());
    }

    let mut output_items = Vec::new();
    if !text.is_empty() {
        output_items.push(json!({
            "type": "message",
            "role": "assistant",
            "content": [{"type": "output_text", "text": text}],
        }));
    }
    for tc in extract_tool_calls(&chat_resp) {
        output_items.push(json!({
            "id": tc.id,
            "type": "function_call",
            "call_id": tc.call_id,
            "name": tc.name,
            "arguments": tc.arguments,
            "status": "completed",
        }));
    }

    let mut out = json!({
        "id": id,
        "object": "response",
        "status": "completed",
        "model": model,
        "output_text": text,
        "output": output_items,
    });
    match chat_usage_to_responses_usage(&chat_resp) {
        Some(usage) => {
            logger.log(format!(
                "non-stream usage present response_id={} model={} {}",
                out["id"].as_str().unwrap_or(""),
                out["model"].as_str().unwrap_or(""),
                format_usage_for_log(&usage)
            ));
            out["usage"] = usage;
        }
        None => {
            logger.log(format!(
                "non-stream usage missing response_id={} model={}",
                out["id"].as_str().unwrap_or(""),
                out["model"].as_str().unwrap_or("")
            ));
            logger.warn("upstream non-stream response missing token usage");
        }
    }
    Json(out).into_response()
}

/// Starts the per-request writer task and hands the client an SSE stream.
/// The writer is inherently serial: one task parses and emits in order, and
/// every event is flushed as its own frame.
pub(super) fn stream_response(logger: Arc<CompatLogger>, upstream: reqwest::Response) -> Response {
    let header = |name: &str| {
        upstream
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    logger.log(format!(
        "forward stream headers status={} content_type={:?} content_encoding={:?} transfer_encoding={:?}",
        upstream.status().as_u16(),
        header("content-type"),
        header("content-encoding"),
        header("transfer-encoding"),
    ));

    let (tx, rx) = mpsc::channel::<Event>(64);
    tokio::spawn(async move {
        let mut writer = ResponsesStream::new(logger, tx);
        let _ = writer.run(upstream).await;
    });
    let mut response = Sse::new(rx.map(Ok::<_, Infallible>)).into_response();
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

struct ToolStreamState {
    output_index: i64,
    item_id: String,
    call_id: String,
    name: String,
    arguments: String,
}

enum LineOutcome {
    Continue,
    Done,
}

struct ResponsesStream {
    tx: mpsc::Sender<Event>,
    logger: Arc<CompatLogger>,
    full_text: String,
    full_reasoning: String,
    model: String,
    resp_id: String,
    msg_item_id: String,
    reasoning_item_id: String,
    tool_states: HashMap<i64, ToolStreamState>,
    tool_order: Vec<i64>,
    raw_json_lines: Vec<String>,
    chunk_samples: Vec<String>,
    chunk_count: usize,
    saw_done: bool,
    first_valid_chunk: String,
    last_valid_chunk: String,
    message_started: bool,
    reasoning_started: bool,
    saw_content_delta: bool,
    reasoning_output_index: i64,
    message_output_index: i64,
    next_output_index: i64,
    last_usage: Option<Value>,
}

impl ResponsesStream {
    fn new(logger: Arc<CompatLogger>, tx: mpsc::Sender<Event>) -> Self {
        let nanos = now_nanos();
        Self {
            tx,
            logger,
            full_text: String::new(),
            full_reasoning: String::new(),
            model: "unknown".to_string(),
            resp_id: format!("resp_{nanos}"),
            msg_item_id: format!("msg_{nanos}"),
            reasoning_item_id: format!("rs_{nanos}"),
            tool_states: HashMap::new(),
            tool_order: Vec::new(),
            raw_json_lines: Vec::new(),
            chunk_samples: Vec::new(),
            chunk_count: 0,
            saw_done: false,
            first_valid_chunk: String::new(),
            last_valid_chunk: String::new(),
            message_started: false,
            reasoning_started: false,
            saw_content_delta: false,
            reasoning_output_index: -1,
            message_output_index: -1,
            next_output_index: 0,
            last_usage: None,
        }
    }

    async fn emit(&mut self, payload: Value) -> Result<(), ClientGone> {
        let Ok(data) = serde_json::to_string(&payload) else {
            return Ok(());
        };
        self.tx
            .send(Event::default().data(data))
            .await
            .map_err(|_| ClientGone)
    }

    async fn emit_done(&mut self) -> Result<(), ClientGone> {
        self.tx
            .send(Event::default().data("[DONE]"))
            .await
            .map_err(|_| ClientGone)
    }

    async fn start_message(&mut self) -> Result<(), ClientGone> {
        if self.message_started {
            return Ok(());
        }
        self.message_started = true;
        self.message_output_index = self.next_output_index;
        self.next_output_index += 1;
        self.emit(json!({
            "type": "response.output_item.added",
            "output_index": self.message_output_index,
            "item": {
                "id": self.msg_item_id,
                "type": "message",
                "status": "in_progress",
                "role": "assistant",
                "content": [],
            },
        }))
        .await?;
        self.emit(json!({
            "type": "response.content_part.added",
            "item_id": self.msg_item_id,
            "output_index": self.message_output_index,
            "content_index": 0,
            "part": {"type": "output_text", "text": ""},
        }))
        .await
    }

    async fn run(&mut self, upstream: reqwest::Response) -> Result<(), ClientGone> {
        let in_progress = |resp_id: &str, model: &str, event: &str| {
            json!({
                "type": event,
                "response": {
                    "id": resp_id,
                    "object": "response",
                    "status": "in_progress",
                    "model": model,
                    "output": [],
                },
            })
        };
        let created = in_progress(&self.resp_id, &self.model, "response.created");
        self.emit(created).await?;
        let progressing = in_progress(&self.resp_id, &self.model, "response.in_progress");
        self.emit(progressing).await?;

        let mut scanner = LineScanner::new();
        let mut body = upstream.bytes_stream();
        let mut scan_error: Option<String> = None;

        'upstream: while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => {
                    scan_error = Some(error.to_string());
                    break;
                }
            };
            let lines = match scanner.feed(&chunk) {
                Ok(lines) => lines,
                Err(error) => {
                    scan_error = Some(error.to_string());
                    break;
                }
            };
            for line in lines {
                if let LineOutcome::Done = self.process_line(&line).await? {
                    break 'upstream;
                }
            }
        }
        if !self.saw_done && scan_error.is_none() {
            if let Some(line) = scanner.finish() {
                let _ = self.process_line(&line).await?;
            }
        }

        self.finalize(scan_error).await
    }

    async fn process_line(&mut self, raw: &str) -> Result<LineOutcome, ClientGone> {
        let Some(classified) = classify_line(raw) else {
            return Ok(LineOutcome::Continue);
        };
        let data = match classified {
            StreamLine::Data(data) => data,
            StreamLine::RawJson(data) => {
                self.raw_json_lines.push(data.clone());
                data
            }
        };
        if data == "[DONE]" {
            self.saw_done = true;
            return Ok(LineOutcome::Done);
        }
        if self.first_valid_chunk.is_empty() {
            self.first_valid_chunk = truncate_for_log(&data, 512);
        }
        self.last_valid_chunk = truncate_for_log(&data, 512);
        self.chunk_count += 1;
        if self.chunk_samples.len() < 12 {
            self.chunk_samples.push(truncate_for_log(&data, 512));
        }

        let chunk = match serde_json::from_str::<Value>(&data) {
            Ok(Value::Object(chunk)) => chunk,
            Ok(_) => {
                if self.chunk_samples.len() < 12 {
                    self.chunk_samples.push("unmarshal_error:not an object".to_string());
                }
                return Ok(LineOutcome::Continue);
            }
            Err(error) => {
                if self.chunk_samples.len() < 12 {
                    self.chunk_samples
                        .push(format!("unmarshal_error:{}", truncate_for_log(&error.to_string(), 200)));
                }
                return Ok(LineOutcome::Continue);
            }
        };

        if let Some(usage) = chat_usage_to_responses_usage(&chunk) {
            let base = self.last_usage.take().unwrap_or_else(|| json!({}));
            self.last_usage = Some(merge_responses_usage(base, usage));
        }
        let model = str_field(&chunk, "model");
        if !model.is_empty() {
            self.model = model.to_string();
        }
        let id = str_field(&chunk, "id");
        if !id.is_empty() {
            self.resp_id = id.to_string();
        }

        let reasoning_delta = extract_reasoning_delta(&chunk);
        if !reasoning_delta.is_empty() {
            if !self.reasoning_started {
                self.reasoning_started = true;
                self.reasoning_output_index = self.next_output_index;
                self.next_output_index += 1;
                self.emit(json!({
                    "type": "response.output_item.added",
                    "output_index": self.reasoning_output_index,
                    "item": {
                        "id": self.reasoning_item_id,
                        "type": "reasoning",
                        "summary": [],
                    },
                }))
                .await?;
            }
            self.full_reasoning.push_str(&reasoning_delta);
            self.emit(json!({
                "type": "response.reasoning_summary_text.delta",
                "item_id": self.reasoning_item_id,
                "output_index": self.reasoning_output_index,
                "summary_index": 0,
                "delta": reasoning_delta,
            }))
            .await?;
            // Some gateways stream only reasoning deltas. Mirror reasoning
            // into output_text until a real content delta shows up, so the
            // client renders something.
            if !self.saw_content_delta {
                self.start_message().await?;
                self.full_text.push_str(&reasoning_delta);
                self.emit(json!({
                    "type": "response.output_text.delta",
                    "item_id": self.msg_item_id,
                    "delta": reasoning_delta,
                    "output_index": self.message_output_index,
                    "content_index": 0,
                    "logprobs": [],
                }))
                .await?;
            }
        }

        for td in extract_tool_call_deltas(&chunk) {
            if td.index < 0 {
                continue;
            }
            if !self.tool_states.contains_key(&td.index) {
                self.tool_states.insert(
                    td.index,
                    ToolStreamState {
                        output_index: self.next_output_index,
                        item_id: format!("fc_{}_{}", now_nanos(), td.index),
                        call_id: String::new(),
                        name: String::new(),
                        arguments: String::new(),
                    },
                );
                self.next_output_index += 1;
                self.tool_order.push(td.index);
            }
            let (added, arguments_delta) = {
                let st = self.tool_states.get_mut(&td.index).expect("tool state just inserted");
                if !td.call_id.is_empty() {
                    st.call_id = td.call_id.clone();
                }
                if st.call_id.is_empty() {
                    st.call_id = st.item_id.clone();
                }
                if !td.name.is_empty() {
                    st.name = td.name.clone();
                }
                let start_args = st.arguments.is_empty();
                if !td.arguments_delta.is_empty() {
                    st.arguments.push_str(&td.arguments_delta);
                }
                let added = (start_args || !td.name.is_empty() || !td.call_id.is_empty()).then(|| {
                    json!({
                        "type": "response.output_item.added",
                        "output_index": st.output_index,
                        "item": {
                            "id": st.item_id,
                            "type": "function_call",
                            "call_id": st.call_id,
                            "name": st.name,
                            "arguments": st.arguments,
                            "status": "in_progress",
                        },
                    })
                });
                let arguments_delta = (!td.arguments_delta.is_empty()).then(|| {
                    json!({
                        "type": "response.function_call_arguments.delta",
                        "item_id": st.item_id,
                        "output_index": st.output_index,
                        "delta": td.arguments_delta,
                    })
                });
                (added, arguments_delta)
            };
            if let Some(payload) = added {
                self.emit(payload).await?;
            }
            if let Some(payload) = arguments_delta {
                self.emit(payload).await?;
            }
        }

        let mut delta = extract_delta(&chunk);
        if delta.is_empty() {
            // Some gateways emit full message chunks in stream mode.
            delta = extract_full_text(&chunk);
        }
        if delta.is_empty() {
            return Ok(LineOutcome::Continue);
        }
        self.saw_content_delta = true;
        self.start_message().await?;
        self.full_text.push_str(&delta);
        self.emit(json!({
            "type": "response.output_text.delta",
            "item_id": self.msg_item_id,
            "delta": delta,
            "output_index": self.message_output_index,
            "content_index": 0,
            "logprobs": [],
        }))
        .await?;
        Ok(LineOutcome::Continue)
    }

    async fn finalize(&mut self, scan_error: Option<String>) -> Result<(), ClientGone> {
        let mut text = self.full_text.clone();

        // NDJSON fallback: a single bare JSON line with nothing emitted means
        // the upstream answered with one complete Chat response.
        if text.is_empty() && self.raw_json_lines.len() == 1 {
            if let Ok(Value::Object(full)) = serde_json::from_str::<Value>(&self.raw_json_lines[0]) {
                text = extract_full_text(&full);
                let model = str_field(&full, "model");
                if !model.is_empty() {
                    self.model = model.to_string();
                }
                let id = str_field(&full, "id");
                if !id.is_empty() {
                    self.resp_id = id.to_string();
                }
                if self.tool_states.is_empty() {
                    for tc in extract_tool_calls(&full) {
                        let idx = self.tool_order.len() as i64;
                        self.tool_states.insert(
                            idx,
                            ToolStreamState {
                                output_index: self.next_output_index,
                                item_id: tc.id,
                                call_id: tc.call_id,
                                name: tc.name,
                                arguments: tc.arguments,
                            },
                        );
                        self.next_output_index += 1;
                        self.tool_order.push(idx);
                    }
                }
            }
        }

        if let Some(error) = &scan_error {
            self.logger.log(format!("upstream stream scan error: {error}"));
        }
        self.logger.log(format!(
            "stream parse summary chunks={} extracted_text_len={} samples={}",
            self.chunk_count,
            text.len(),
            truncate_for_log(&self.chunk_samples.join(" || "), LOG_PREVIEW_BYTES),
        ));
        self.logger.log(format!(
            "stream parse flags saw_done={} saw_content_delta={} reasoning_len={} first_chunk={:?} last_chunk={:?}",
            self.saw_done,
            self.saw_content_delta,
            self.full_reasoning.len(),
            self.first_valid_chunk,
            self.last_valid_chunk,
        ));

        if let Some(error) = scan_error {
            if self.chunk_count == 0 {
                self.logger.warn("upstream stream failed before first chunk");
                self.emit(json!({
                    "type": "error",
                    "error": {
                        "type": "upstream_stream_error",
                        "message": format!("upstream stream parse failed before first chunk: {error}"),
                    },
                }))
                .await?;
                return self.emit_done().await;
            }
        }
        if text.is_empty() {
            self.logger.warn("stream response extracted empty text");
        }

        if self.reasoning_started {
            self.emit(json!({
                "type": "response.reasoning_summary_text.done",
                "item_id": self.reasoning_item_id,
                "output_index": self.reasoning_output_index,
                "summary_index": 0,
                "text": self.full_reasoning,
            }))
            .await?;
            self.emit(json!({
                "type": "response.output_item.done",
                "output_index": self.reasoning_output_index,
                "item": {
                    "id": self.reasoning_item_id,
                    "type": "reasoning",
                    "summary": [{"type": "summary_text", "text": self.full_reasoning}],
                },
            }))
            .await?;
        }

        for idx in self.tool_order.clone() {
            let (arguments_done, item_done) = {
                let st = self.tool_states.get_mut(&idx).expect("tool order tracks states");
                if st.call_id.is_empty() {
                    st.call_id = st.item_id.clone();
                }
                let arguments = if st.arguments.is_empty() {
                    "{}".to_string()
                } else {
                    st.arguments.clone()
                };
                (
                    json!({
                        "type": "response.function_call_arguments.done",
                        "item_id": st.item_id,
                        "output_index": st.output_index,
                        "arguments": arguments,
                    }),
                    json!({
                        "type": "response.output_item.done",
                        "output_index": st.output_index,
                        "item": {
                            "id": st.item_id,
                            "type": "function_call",
                            "call_id": st.call_id,
                            "name": st.name,
                            "arguments": arguments,
                            "status": "completed",
                        },
                    }),
                )
            };
            self.emit(arguments_done).await?;
            self.emit(item_done).await?;
        }

        if self.message_started {
            self.emit(json!({
                "type": "response.output_text.done",
                "item_id": self.msg_item_id,
                "text": text,
                "output_index": self.message_output_index,
                "content_index": 0,
                "logprobs": [],
            }))
            .await?;
            self.emit(json!({
                "type": "response.content_part.done",
                "item_id": self.msg_item_id,
                "output_index": self.message_output_index,
                "content_index": 0,
                "part": {"type": "output_text", "text": text},
            }))
            .await?;
            self.emit(json!({
                "type": "response.output_item.done",
                "output_index": self.message_output_index,
                "item": {
                    "id": self.msg_item_id,
                    "type": "message",
                    "status": "completed",
                    "role": "assistant",
                    "content": [{"type": "output_text", "text": text}],
                },
            }))
            .await?;
        }

        let mut output_items = Vec::new();
        if self.reasoning_started {
            output_items.push(json!({
                "id": self.reasoning_item_id,
                "type": "reasoning",
                "summary": [{"type": "summary_text", "text": self.full_reasoning}],
            }));
        }
        for idx in &self.tool_order {
            let st = &self.tool_states[idx];
            let arguments = if st.arguments.is_empty() { "{}" } else { st.arguments.as_str() };
            let call_id = if st.call_id.is_empty() { &st.item_id } else { &st.call_id };
            output_items.push(json!({
                "id": st.item_id,
                "type": "function_call",
                "call_id": call_id,
                "name": st.name,
                "arguments": arguments,
                "status": "completed",
            }));
        }
        if self.message_started {
            output_items.push(json!({
                "id": self.msg_item_id,
                "type": "message",
                "status": "completed",
                "role": "assistant",
                "content": [{"type": "output_text", "text": text}],
            }));
        }

        let mut response = json!({
            "id": self.resp_id,
            "object": "response",
            "status": "completed",
            "model": self.model,
            "output_text": text,
            "output": output_items,
        });
        match &self.last_usage {
            Some(usage) => {
                self.logger.log(format!(
                    "stream usage present response_id={} model={} {}",
                    self.resp_id,
                    self.model,
                    format_usage_for_log(usage)
                ));
                response["usage"] = usage.clone();
            }
            None => {
                self.logger.log(format!(
                    "stream usage missing response_id={} model={} chunks={} saw_done={}",
                    self.resp_id, self.model, self.chunk_count, self.saw_done
                ));
                self.logger.warn("upstream stream completed without token usage");
            }
        }
        self.emit(json!({"type": "response.completed", "response": response}))
            .await?;
        self.emit_done().await
    }
}
