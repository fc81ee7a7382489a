//! Response writers for the Anthropic Messages dialect.
//!
//! Streamed output follows the Anthropic event grammar: `message_start`,
//! block lifecycles (`content_block_start` → `content_block_delta*` →
//! `content_block_stop`), a final `message_delta` with stop reason and
//! usage, then `message_stop`. Every frame carries an `event:` name.

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
use serde_json::{Map, Value, json};

use crate::{
    anthropic::translate::chat_to_anthropic_message,
    chat::{
        extract_delta, extract_full_text, extract_tool_call_deltas, extract_tool_calls, int_field,
        map_field, now_nanos, str_field,
    },
    decode::{LOG_PREVIEW_BYTES, truncate_for_log},
    error::{AnthropicCompatError, CompatError},
    logfile::CompatLogger,
    sse::{ClientGone, LineScanner, StreamLine, classify_line},
};

/// Translates a non-stream upstream Chat response into one Anthropic
/// Message object.
pub(super) async fn non_stream_response(
    logger: &CompatLogger,
    upstream: reqwest::Response,
    requested_model: &str,
) -> Response {
    let raw = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(_) => {
            return AnthropicCompatError::from(CompatError::InvalidUpstreamResponse).into_response();
        }
    };
    let Ok(Value::Object(chat_resp)) = serde_json::from_slice::<Value>(&raw) else {
        logger.log(format!(
            "upstream invalid json={}",
            truncate_for_log(&String::from_utf8_lossy(&raw), LOG_PREVIEW_BYTES)
        ));
        return AnthropicCompatError::from(CompatError::InvalidUpstreamResponse).into_response();
    };
    logger.log(format!(
        "upstream response={}",
        truncate_for_log(
            &serde_json::to_string(&chat_resp).unwrap_or_default(),
            LOG_PREVIEW_BYTES
        )
    ));
    let msg = chat_to_anthropic_message(&chat_resp, requested_model);
    Json(msg).into_response()
}

/// Starts the per-request writer task and hands the client the SSE stream.
pub(super) fn stream_response(
    logger: Arc<CompatLogger>,
    upstream: reqwest::Response,
    requested_model: String,
) -> Response {
    let (tx, rx) = mpsc::channel::<Event>(64);
    tokio::spawn(async move {
        let mut writer = AnthropicStream::new(logger, tx, &requested_model);
        let _ = writer.run(upstream, &requested_model).await;
    });
    let mut response = Sse::new(rx.map(Ok::<_, Infallible>)).into_response();
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

struct ToolBlockState {
    block_index: i64,
    id: String,
    name: String,
    arguments: String,
    closed: bool,
}

struct AnthropicStream {
    tx: mpsc::Sender<Event>,
    logger: Arc<CompatLogger>,
    resp_id: String,
    model: String,
    text_block_index: i64,
    text_closed: bool,
    next_block_index: i64,
    text_content: String,
    tool_states: HashMap<i64, ToolBlockState>,
    tool_order: Vec<i64>,
    final_chunk: Option<Map<String, Value>>,
    chunk_count: usize,
    saw_done: bool,
    first_valid_chunk: String,
    last_valid_chunk: String,
    finish_reason: String,
    prompt_tokens: i64,
    completion_tokens: i64,
    message_started: bool,
}

impl AnthropicStream {
    fn new(logger: Arc<CompatLogger>, tx: mpsc::Sender<Event>, requested_model: &str) -> Self {
        let model = if requested_model.is_empty() {
            "unknown".to_string()
        } else {
            requested_model.to_string()
        };
        Self {
            tx,
            logger,
            resp_id: format!("msg_{}", now_nanos()),
            model,
            text_block_index: -1,
            text_closed: false,
            next_block_index: 0,
            text_content: String::new(),
            tool_states: HashMap::new(),
            tool_order: Vec::new(),
            final_chunk: None,
            chunk_count: 0,
            saw_done: false,
            first_valid_chunk: String::new(),
            last_valid_chunk: String::new(),
            finish_reason: String::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            message_started: false,
        }
    }

    async fn emit(&mut self, event: &str, payload: Value) -> Result<(), ClientGone> {
        let Ok(data) = serde_json::to_string(&payload) else {
            return Ok(());
        };
        self.tx
            .send(Event::default().event(event).data(data))
            .await
            .map_err(|_| ClientGone)
    }

    async fn start_message(&mut self) -> Result<(), ClientGone> {
        if self.message_started {
            return Ok(());
        }
        self.message_started = true;
        let payload = json!({
            "type": "message_start",
            "message": {
                "id": self.resp_id,
                "type": "message",
                "role": "assistant",
                "model": self.model,
                "content": [],
                "usage": {"input_tokens": self.prompt_tokens, "output_tokens": 0},
            },
        });
        self.emit("message_start", payload).await
    }

    async fn start_text_block(&mut self) -> Result<(), ClientGone> {
        if self.text_block_index >= 0 {
            return Ok(());
        }
        self.start_message().await?;
        self.text_block_index = self.next_block_index;
        self.next_block_index += 1;
        let payload = json!({
            "type": "content_block_start",
            "index": self.text_block_index,
            "content_block": {"type": "text", "text": ""},
        });
        self.emit("content_block_start", payload).await
    }

    async fn emit_text_delta(&mut self, delta: &str) -> Result<(), ClientGone> {
        if delta.is_empty() {
            return Ok(());
        }
        self.start_text_block().await?;
        self.text_content.push_str(delta);
        let payload = json!({
            "type": "content_block_delta",
            "index": self.text_block_index,
            "delta": {"type": "text_delta", "text": delta},
        });
        self.emit("content_block_delta", payload).await
    }

    async fn close_text_block(&mut self) -> Result<(), ClientGone> {
        if self.text_block_index < 0 || self.text_closed {
            return Ok(());
        }
        self.text_closed = true;
        let payload = json!({
            "type": "content_block_stop",
            "index": self.text_block_index,
        });
        self.emit("content_block_stop", payload).await
    }

    /// Opens (or refreshes the identity of) the tool block for a stream
    /// index, emitting `content_block_start` on first appearance.
    async fn ensure_tool_block(
        &mut self,
        idx: i64,
        call_id: &str,
        name: &str,
    ) -> Result<(), ClientGone> {
        if let Some(st) = self.tool_states.get_mut(&idx) {
            if !call_id.is_empty() {
                st.id = call_id.to_string();
            }
            if !name.is_empty() {
                st.name = name.to_string();
            }
            return Ok(());
        }
        self.start_message().await?;
        let id = if call_id.is_empty() {
            format!("toolu_{}_{idx}", now_nanos())
        } else {
            call_id.to_string()
        };
        let name = if name.is_empty() { "unknown_tool" } else { name };
        let block_index = self.next_block_index;
        self.next_block_index += 1;
        self.tool_states.insert(
            idx,
            ToolBlockState {
                block_index,
                id: id.clone(),
                name: name.to_string(),
                arguments: String::new(),
                closed: false,
            },
        );
        self.tool_order.push(idx);
        let payload = json!({
            "type": "content_block_start",
            "index": block_index,
            "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}},
        });
        self.emit("content_block_start", payload).await
    }

    async fn run(
        &mut self,
        upstream: reqwest::Response,
        requested_model: &str,
    ) -> Result<(), ClientGone> {
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
                if self.process_line(&line).await? {
                    break 'upstream;
                }
            }
        }
        if !self.saw_done && scan_error.is_none() {
            if let Some(line) = scanner.finish() {
                let _ = self.process_line(&line).await?;
            }
        }

        if let Some(error) = &scan_error {
            self.logger.log(format!("stream scan error: {error}"));
        }
        self.logger.log(format!(
            "stream parse flags chunks={} saw_done={} message_started={} first_chunk={:?} last_chunk={:?}",
            self.chunk_count,
            self.saw_done,
            self.message_started,
            self.first_valid_chunk,
            self.last_valid_chunk,
        ));

        if !self.message_started {
            // Nothing was streamable. If a full chunk was seen, synthesize
            // the whole event sequence from it; otherwise report the empty
            // stream in-band (headers are already committed).
            return match self.final_chunk.take() {
                Some(chunk) => {
                    let msg = chat_to_anthropic_message(&chunk, requested_model);
                    self.write_stream_from_message(&msg).await
                }
                None => {
                    let payload = json!({
                        "type": "error",
                        "error": {"type": "api_error", "message": "empty upstream stream"},
                    });
                    self.emit("error", payload).await
                }
            };
        }

        self.close_text_block().await?;
        for idx in self.tool_order.clone() {
            let payload = {
                let st = self.tool_states.get_mut(&idx).expect("tool order tracks states");
                if st.closed {
                    continue;
                }
                st.closed = true;
                json!({"type": "content_block_stop", "index": st.block_index})
            };
            self.emit("content_block_stop", payload).await?;
        }

        let mut stop_reason = match self.finish_reason.as_str() {
            "length" => "max_tokens",
            "tool_calls" => "tool_use",
            _ => "end_turn",
        };
        if !self.tool_order.is_empty() {
            stop_reason = "tool_use";
        }
        let payload = json!({
            "type": "message_delta",
            "delta": {"stop_reason": stop_reason, "stop_sequence": null},
            "usage": {
                "input_tokens": self.prompt_tokens,
                "output_tokens": self.completion_tokens,
            },
        });
        self.emit("message_delta", payload).await?;
        self.emit("message_stop", json!({"type": "message_stop"})).await
    }

    /// Processes one scanned line; returns `true` when `[DONE]` arrived.
    async fn process_line(&mut self, raw: &str) -> Result<bool, ClientGone> {
        let Some(classified) = classify_line(raw) else {
            return Ok(false);
        };
        let data = match classified {
            StreamLine::Data(data) | StreamLine::RawJson(data) => data,
        };
        if data == "[DONE]" {
            self.saw_done = true;
            return Ok(true);
        }
        self.chunk_count += 1;
        if self.first_valid_chunk.is_empty() {
            self.first_valid_chunk = truncate_for_log(&data, 512);
        }
        self.last_valid_chunk = truncate_for_log(&data, 512);

        let chunk = match serde_json::from_str::<Value>(&data) {
            Ok(Value::Object(chunk)) => chunk,
            Ok(_) => return Ok(false),
            Err(error) => {
                self.logger.log(format!(
                    "stream unmarshal error: {error} data={}",
                    truncate_for_log(&data, 512)
                ));
                return Ok(false);
            }
        };
        self.final_chunk = Some(chunk.clone());

        let id = str_field(&chunk, "id");
        if !id.is_empty() {
            self.resp_id = id.to_string();
        }
        let model = str_field(&chunk, "model");
        if !model.is_empty() {
            self.model = model.to_string();
        }
        if let Some(usage) = map_field(&chunk, "usage") {
            let prompt = int_field(usage, "prompt_tokens");
            if prompt > 0 {
                self.prompt_tokens = prompt;
            }
            let completion = int_field(usage, "completion_tokens");
            if completion > 0 {
                self.completion_tokens = completion;
            }
        }
        if let Some(c0) = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .and_then(Value::as_object)
        {
            let finish_reason = str_field(c0, "finish_reason");
            if !finish_reason.is_empty() {
                self.finish_reason = finish_reason.to_string();
            }
        }

        let mut delta = extract_delta(&chunk);
        if delta.is_empty() {
            delta = extract_full_text(&chunk);
        }
        if !delta.is_empty() {
            self.emit_text_delta(&delta).await?;
        }

        let tool_deltas = extract_tool_call_deltas(&chunk);
        for td in &tool_deltas {
            if td.index < 0 {
                continue;
            }
            self.ensure_tool_block(td.index, &td.call_id, &td.name).await?;
            if td.arguments_delta.is_empty() {
                continue;
            }
            let payload = {
                let st = self.tool_states.get_mut(&td.index).expect("block just ensured");
                st.arguments.push_str(&td.arguments_delta);
                json!({
                    "type": "content_block_delta",
                    "index": st.block_index,
                    "delta": {"type": "input_json_delta", "partial_json": td.arguments_delta},
                })
            };
            self.emit("content_block_delta", payload).await?;
        }

        // Some gateways stream a full message object instead of delta
        // tool_calls. Backfill tool_use blocks in that case.
        if tool_deltas.is_empty() {
            for (i, tc) in extract_tool_calls(&chunk).into_iter().enumerate() {
                let idx = i as i64;
                self.ensure_tool_block(idx, &tc.call_id, &tc.name).await?;
                if tc.arguments.is_empty() {
                    continue;
                }
                let payload = {
                    let st = self.tool_states.get_mut(&idx).expect("block just ensured");
                    if !st.arguments.is_empty() {
                        continue;
                    }
                    st.arguments.push_str(&tc.arguments);
                    json!({
                        "type": "content_block_delta",
                        "index": st.block_index,
                        "delta": {"type": "input_json_delta", "partial_json": tc.arguments},
                    })
                };
                self.emit("content_block_delta", payload).await?;
            }
        }
        Ok(false)
    }

    /// Synthesizes the complete event sequence from a single translated
    /// message: deterministic block indices, same event order as the live
    /// streaming path.
    async fn write_stream_from_message(&mut self, msg: &Value) -> Result<(), ClientGone> {
        let empty = Map::new();
        let m = msg.as_object().unwrap_or(&empty);
        let usage = map_field(m, "usage").cloned().unwrap_or_default();

        let payload = json!({
            "type": "message_start",
            "message": {
                "id": str_field(m, "id"),
                "type": "message",
                "role": "assistant",
                "model": str_field(m, "model"),
                "content": [],
                "usage": {
                    "input_tokens": int_field(&usage, "input_tokens"),
                    "output_tokens": 0,
                },
            },
        });
        self.emit("message_start", payload).await?;

        let blocks = m.get("content").and_then(Value::as_array).cloned().unwrap_or_default();
        for (i, raw) in blocks.iter().enumerate() {
            let Some(block) = raw.as_object() else { continue };
            match str_field(block, "type") {
                "text" => {
                    let start = json!({
                        "type": "content_block_start",
                        "index": i,
                        "content_block": {"type": "text", "text": ""},
                    });
                    self.emit("content_block_start", start).await?;
                    let text = str_field(block, "text");
                    if !text.is_empty() {
                        let delta = json!({
                            "type": "content_block_delta",
                            "index": i,
                            "delta": {"type": "text_delta", "text": text},
                        });
                        self.emit("content_block_delta", delta).await?;
                    }
                    let stop = json!({"type": "content_block_stop", "index": i});
                    self.emit("content_block_stop", stop).await?;
                }
                "tool_use" => {
                    let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                    let start = json!({
                        "type": "content_block_start",
                        "index": i,
                        "content_block": {
                            "type": "tool_use",
                            "id": str_field(block, "id"),
                            "name": str_field(block, "name"),
                            "input": input.clone(),
                        },
                    });
                    self.emit("content_block_start", start).await?;
                    if let Ok(partial_json) = serde_json::to_string(&input) {
                        let delta = json!({
                            "type": "content_block_delta",
                            "index": i,
                            "delta": {"type": "input_json_delta", "partial_json": partial_json},
                        });
                        self.emit("content_block_delta", delta).await?;
                    }
                    let stop = json!({"type": "content_block_stop", "index": i});
                    self.emit("content_block_stop", stop).await?;
                }
                _ => {}
            }
        }

        let payload = json!({
            "type": "message_delta",
            "delta": {
                "stop_reason": m.get("stop_reason").cloned().unwrap_or(Value::Null),
                "stop_sequence": m.get("stop_sequence").cloned().unwrap_or(Value::Null),
            },
            "usage": {
                "input_tokens": int_field(&usage, "input_tokens"),
                "output_tokens": int_field(&usage, "output_tokens"),
            },
        });
        self.emit("message_delta", payload).await?;
        self.emit("message_stop", json!({"type": "message_stop"})).await
    }
}
