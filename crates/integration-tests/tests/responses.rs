//! End-to-end tests for the Responses adapter against a scripted upstream.

use compat::{ResponsesAdapter, UpstreamConfig};
use integration_tests::{
    MockUpstream, UpstreamScript, assert_responses_stream_invariants, event_types, parse_sse_frames,
};
use serde_json::{Value, json};

async fn start_adapter(upstream: &MockUpstream) -> ResponsesAdapter {
    ResponsesAdapter::start(UpstreamConfig {
        base_url: upstream.base_url().to_string(),
        api_key: Some("test-key".to_string().into()),
    })
    .await
    .expect("adapter should start")
}

fn responses_url(adapter: &ResponsesAdapter) -> String {
    format!("{}/responses", adapter.base_url())
}

#[tokio::test]
async fn streams_text_deltas_in_order() {
    let upstream = MockUpstream::start(vec![UpstreamScript::Sse(vec![
        r#"data: {"id":"c1","model":"M","choices":[{"delta":{"content":"Hel"}}]}"#.into(),
        r#"data: {"id":"c1","model":"M","choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}],"usage":{"prompt_tokens":11,"completion_tokens":3}}"#.into(),
        "data: [DONE]".into(),
    ])])
    .await;
    let adapter = start_adapter(&upstream).await;

    let body = reqwest::Client::new()
        .post(responses_url(&adapter))
        .json(&json!({"model": "M", "input": "hi", "stream": true}))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let frames = parse_sse_frames(&body);

    assert_eq!(
        event_types(&frames),
        vec![
            "response.created",
            "response.in_progress",
            "response.output_item.added",
            "response.content_part.added",
            "response.output_text.delta",
            "response.output_text.delta",
            "response.output_text.done",
            "response.content_part.done",
            "response.output_item.done",
            "response.completed",
            "[DONE]",
        ]
    );
    assert_eq!(frames[4].json()["delta"], json!("Hel"));
    assert_eq!(frames[5].json()["delta"], json!("lo"));

    let completed = frames[9].json();
    assert_eq!(completed["response"]["output_text"], json!("Hello"));
    assert_eq!(completed["response"]["status"], json!("completed"));
    assert_eq!(completed["response"]["model"], json!("M"));
    assert_eq!(completed["response"]["usage"]["input_tokens"], json!(11));
    assert_eq!(completed["response"]["usage"]["output_tokens"], json!(3));
    assert_eq!(completed["response"]["usage"]["total_tokens"], json!(14));

    assert_responses_stream_invariants(&frames);
    adapter.close().await;
}

#[tokio::test]
async fn streams_tool_call_deltas_and_completes_the_call() {
    let upstream = MockUpstream::start(vec![UpstreamScript::Sse(vec![
        r#"data: {"id":"c1","model":"M","choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"sum","arguments":"{\"a\":"}}]}}]}"#.into(),
        r#"data: {"id":"c1","model":"M","choices":[{"delta":{"tool_calls":[{"index":0,"type":"function","function":{"arguments":"1}"}}]}}]}"#.into(),
        "data: [DONE]".into(),
    ])])
    .await;
    let adapter = start_adapter(&upstream).await;

    let body = reqwest::Client::new()
        .post(responses_url(&adapter))
        .json(&json!({"model": "M", "input": "add", "stream": true}))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let frames = parse_sse_frames(&body);

    let argument_deltas: String = frames
        .iter()
        .filter(|f| f.event_type() == "response.function_call_arguments.delta")
        .map(|f| f.json()["delta"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(argument_deltas, r#"{"a":1}"#);

    let item_done = frames
        .iter()
        .find(|f| f.event_type() == "response.output_item.done")
        .expect("function_call item must close");
    assert_eq!(item_done.json()["item"]["type"], json!("function_call"));
    assert_eq!(item_done.json()["item"]["call_id"], json!("call_1"));
    assert_eq!(item_done.json()["item"]["status"], json!("completed"));

    let completed = frames
        .iter()
        .find(|f| f.event_type() == "response.completed")
        .unwrap()
        .json();
    let output = completed["response"]["output"].as_array().unwrap();
    assert_eq!(output.len(), 1);
    assert_eq!(output[0]["type"], json!("function_call"));
    assert_eq!(output[0]["call_id"], json!("call_1"));
    assert_eq!(output[0]["name"], json!("sum"));
    assert_eq!(output[0]["arguments"], json!(r#"{"a":1}"#));
    assert_eq!(output[0]["status"], json!("completed"));

    assert_responses_stream_invariants(&frames);
    adapter.close().await;
}

#[tokio::test]
async fn merges_usage_across_stream_chunks_without_stale_details() {
    let upstream = MockUpstream::start(vec![UpstreamScript::Sse(vec![
        r#"data: {"id":"c1","model":"M","choices":[{"delta":{"content":"Hel"}}],"usage":{"prompt_tokens":11,"completion_tokens":1}}"#.into(),
        r#"data: {"id":"c1","model":"M","choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}],"usage":{"prompt_tokens":11,"completion_tokens":3,"total_tokens":14,"completion_tokens_details":{"reasoning_tokens":2}}}"#.into(),
        "data: [DONE]".into(),
    ])])
    .await;
    let adapter = start_adapter(&upstream).await;

    let body = reqwest::Client::new()
        .post(responses_url(&adapter))
        .json(&json!({"model": "M", "input": "hi", "stream": true}))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let frames = parse_sse_frames(&body);

    let completed = frames
        .iter()
        .find(|f| f.event_type() == "response.completed")
        .unwrap()
        .json();
    let usage = &completed["response"]["usage"];
    assert_eq!(usage["input_tokens"], json!(11));
    assert_eq!(usage["output_tokens"], json!(3));
    assert_eq!(usage["total_tokens"], json!(14));
    // The second chunk refreshed the reasoning detail; flat scalar and
    // nested map agree, and no stale detail map from the first chunk leaks.
    assert_eq!(usage["reasoning_output_tokens"], json!(2));
    assert_eq!(usage["output_tokens_details"], json!({"reasoning_tokens": 2}));
    assert_eq!(usage["cached_input_tokens"], json!(0));
    assert_eq!(usage.get("input_tokens_details"), None);

    assert_responses_stream_invariants(&frames);
    adapter.close().await;
}

#[tokio::test]
async fn non_stream_tool_calls_become_function_call_items() {
    let upstream = MockUpstream::start(vec![UpstreamScript::Json {
        status: 200,
        body: json!({
            "id": "c1",
            "model": "M",
            "choices": [{"message": {"tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": {"name": "sum", "arguments": "{\"a\":1}"},
            }]}}],
        }),
    }])
    .await;
    let adapter = start_adapter(&upstream).await;

    let out: Value = reqwest::Client::new()
        .post(responses_url(&adapter))
        .json(&json!({"model": "M", "input": "add"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(out["object"], json!("response"));
    assert_eq!(out["status"], json!("completed"));
    let output = out["output"].as_array().unwrap();
    assert_eq!(output.len(), 1, "no message item expected: {output:?}");
    assert_eq!(output[0]["type"], json!("function_call"));
    assert_eq!(output[0]["name"], json!("sum"));
    assert_eq!(output[0]["arguments"], json!(r#"{"a":1}"#));
    adapter.close().await;
}

#[tokio::test]
async fn non_stream_maps_usage_details() {
    let upstream = MockUpstream::start(vec![UpstreamScript::Json {
        status: 200,
        body: json!({
            "id": "c1",
            "model": "M",
            "choices": [{"message": {"content": "ok"}}],
            "usage": {
                "prompt_tokens": 10,
                "completion_tokens": 4,
                "total_tokens": 14,
                "prompt_tokens_details": {"cached_tokens": 3},
                "completion_tokens_details": {"reasoning_tokens": 2},
            },
        }),
    }])
    .await;
    let adapter = start_adapter(&upstream).await;

    let out: Value = reqwest::Client::new()
        .post(responses_url(&adapter))
        .json(&json!({"model": "M", "input": "hi"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(out["output_text"], json!("ok"));
    assert_eq!(out["usage"]["input_tokens"], json!(10));
    assert_eq!(out["usage"]["output_tokens"], json!(4));
    assert_eq!(out["usage"]["total_tokens"], json!(14));
    assert_eq!(out["usage"]["cached_input_tokens"], json!(3));
    assert_eq!(out["usage"]["reasoning_output_tokens"], json!(2));
    assert_eq!(out["usage"]["input_tokens_details"], json!({"cached_tokens": 3}));
    assert_eq!(out["usage"]["output_tokens_details"], json!({"reasoning_tokens": 2}));
    adapter.close().await;
}

#[tokio::test]
async fn ndjson_upstream_without_framing_still_streams_text() {
    let upstream = MockUpstream::start(vec![UpstreamScript::Raw {
        body: format!(
            "{}\n",
            json!({"id": "c1", "model": "M", "choices": [{"message": {"content": "你好"}}]})
        ),
        content_type: "application/x-ndjson",
    }])
    .await;
    let adapter = start_adapter(&upstream).await;

    let body = reqwest::Client::new()
        .post(responses_url(&adapter))
        .json(&json!({"model": "M", "input": "hi", "stream": true}))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let frames = parse_sse_frames(&body);

    let done = frames
        .iter()
        .find(|f| f.event_type() == "response.output_text.done")
        .expect("text must materialize from the NDJSON line");
    assert_eq!(done.json()["text"], json!("你好"));
    assert_responses_stream_invariants(&frames);
    adapter.close().await;
}

#[tokio::test]
async fn ndjson_tool_only_response_materializes_function_calls() {
    let upstream = MockUpstream::start(vec![UpstreamScript::Raw {
        body: format!(
            "{}\n",
            json!({"id": "c1", "model": "M", "choices": [{"message": {"tool_calls": [
                {"id": "call_1", "type": "function", "function": {"name": "sum", "arguments": "{\"a\":1}"}},
                {"id": "call_2", "type": "function", "function": {"name": "mul", "arguments": "{\"b\":2}"}},
            ]}}]})
        ),
        content_type: "application/x-ndjson",
    }])
    .await;
    let adapter = start_adapter(&upstream).await;

    let body = reqwest::Client::new()
        .post(responses_url(&adapter))
        .json(&json!({"model": "M", "input": "go", "stream": true}))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let frames = parse_sse_frames(&body);

    let completed = frames
        .iter()
        .find(|f| f.event_type() == "response.completed")
        .unwrap()
        .json();
    let output = completed["response"]["output"].as_array().unwrap();
    assert_eq!(output.len(), 2);
    assert_eq!(output[0]["call_id"], json!("call_1"));
    assert_eq!(output[1]["call_id"], json!("call_2"));
    assert_eq!(
        frames
            .iter()
            .filter(|f| f.event_type() == "response.function_call_arguments.done")
            .count(),
        2
    );
    adapter.close().await;
}

#[tokio::test]
async fn reasoning_deltas_are_mirrored_until_content_arrives() {
    let upstream = MockUpstream::start(vec![UpstreamScript::Sse(vec![
        r#"data: {"id":"c1","model":"M","choices":[{"delta":{"reasoning":"thinking "}}]}"#.into(),
        r#"data: {"id":"c1","model":"M","choices":[{"delta":{"reasoning":"hard"}}]}"#.into(),
        r#"data: {"id":"c1","model":"M","choices":[{"delta":{"content":"answer"}}]}"#.into(),
        "data: [DONE]".into(),
    ])])
    .await;
    let adapter = start_adapter(&upstream).await;

    let body = reqwest::Client::new()
        .post(responses_url(&adapter))
        .json(&json!({"model": "M", "input": "hi", "stream": true}))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let frames = parse_sse_frames(&body);

    let reasoning_deltas: String = frames
        .iter()
        .filter(|f| f.event_type() == "response.reasoning_summary_text.delta")
        .map(|f| f.json()["delta"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(reasoning_deltas, "thinking hard");

    // Mirrored reasoning plus the real content delta; mirroring stops once
    // content arrives but the mirrored prefix stays.
    let text_deltas: Vec<String> = frames
        .iter()
        .filter(|f| f.event_type() == "response.output_text.delta")
        .map(|f| f.json()["delta"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(text_deltas, vec!["thinking ", "hard", "answer"]);

    let completed = frames
        .iter()
        .find(|f| f.event_type() == "response.completed")
        .unwrap()
        .json();
    assert_eq!(completed["response"]["output_text"], json!("thinking hardanswer"));
    let output = completed["response"]["output"].as_array().unwrap();
    assert_eq!(output[0]["type"], json!("reasoning"));
    assert_eq!(
        output[0]["summary"],
        json!([{"type": "summary_text", "text": "thinking hard"}])
    );
    assert_eq!(output[1]["type"], json!("message"));

    assert_responses_stream_invariants(&frames);
    adapter.close().await;
}

#[tokio::test]
async fn retries_with_minimal_request_on_invalid_json() {
    let upstream = MockUpstream::start(vec![
        UpstreamScript::Text {
            status: 400,
            body: "invalid json".into(),
        },
        UpstreamScript::Sse(vec![
            r#"data: {"id":"c1","model":"M","choices":[{"delta":{"content":"ok"}}]}"#.into(),
            "data: [DONE]".into(),
        ]),
    ])
    .await;
    let adapter = start_adapter(&upstream).await;

    let response = reqwest::Client::new()
        .post(responses_url(&adapter))
        .json(&json!({
            "model": "M",
            "input": "hi",
            "stream": true,
            "tools": [{"type": "function", "name": "sum", "parameters": {"type": "object"}}],
            "temperature": 0.5,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let frames = parse_sse_frames(&response.text().await.unwrap());

    // The client sees one clean stream, as if the first attempt never happened.
    assert!(frames.iter().any(|f| f.event_type() == "response.output_text.delta"));
    assert_responses_stream_invariants(&frames);

    let requests = upstream.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].get("tools").is_some());
    let retry = requests[1].as_object().unwrap();
    let mut keys: Vec<&str> = retry.keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(keys, vec!["messages", "model", "stream"]);
    adapter.close().await;
}

#[tokio::test]
async fn falls_back_to_ultra_minimal_request() {
    let upstream = MockUpstream::start(vec![
        UpstreamScript::Text {
            status: 400,
            body: "invalid json".into(),
        },
        UpstreamScript::Json {
            status: 400,
            body: json!({"error": {"message": "still invalid json"}}),
        },
        UpstreamScript::Json {
            status: 200,
            body: json!({"id": "c1", "model": "M", "choices": [{"message": {"content": "ok"}}]}),
        },
    ])
    .await;
    let adapter = start_adapter(&upstream).await;

    let out: Value = reqwest::Client::new()
        .post(responses_url(&adapter))
        .json(&json!({
            "model": "M",
            "input": [
                {"role": "developer", "content": "be brief"},
                {"role": "user", "content": "你好"},
            ],
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(out["output_text"], json!("ok"));

    let requests = upstream.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(
        requests[2]["messages"],
        json!([{"role": "user", "content": "你好"}])
    );
    adapter.close().await;
}

#[tokio::test]
async fn upstream_json_errors_are_forwarded_verbatim() {
    let error_body = json!({"error": {"message": "quota exhausted", "code": "billing"}});
    let upstream = MockUpstream::start(vec![UpstreamScript::Json {
        status: 403,
        body: error_body.clone(),
    }])
    .await;
    let adapter = start_adapter(&upstream).await;

    let response = reqwest::Client::new()
        .post(responses_url(&adapter))
        .json(&json!({"model": "M", "input": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 403);
    assert_eq!(response.json::<Value>().await.unwrap(), error_body);
    adapter.close().await;
}

#[tokio::test]
async fn upstream_plain_text_errors_are_wrapped() {
    let upstream = MockUpstream::start(vec![UpstreamScript::Text {
        status: 503,
        body: "overloaded".into(),
    }])
    .await;
    let adapter = start_adapter(&upstream).await;

    let response = reqwest::Client::new()
        .post(responses_url(&adapter))
        .json(&json!({"model": "M", "input": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 503);
    assert_eq!(
        response.json::<Value>().await.unwrap(),
        json!({"error": {"message": "overloaded", "type": "invalid_request_error"}})
    );
    adapter.close().await;
}

#[tokio::test]
async fn rejects_non_post_methods() {
    let upstream = MockUpstream::start(vec![]).await;
    let adapter = start_adapter(&upstream).await;

    let response = reqwest::Client::new()
        .get(responses_url(&adapter))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 405);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], json!("invalid_request_error"));
    assert_eq!(upstream.request_count(), 0);
    adapter.close().await;
}

#[tokio::test]
async fn rejects_malformed_bodies_with_a_decode_error() {
    let upstream = MockUpstream::start(vec![]).await;
    let adapter = start_adapter(&upstream).await;

    let response = reqwest::Client::new()
        .post(responses_url(&adapter))
        .header("content-type", "application/json")
        .body("not-json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    let message = body["error"]["message"].as_str().unwrap();
    assert!(message.contains("invalid json"), "unexpected message: {message}");
    adapter.close().await;
}

#[tokio::test]
async fn accepts_gzip_encoded_requests() {
    use std::io::Write;

    let upstream = MockUpstream::start(vec![UpstreamScript::Json {
        status: 200,
        body: json!({"id": "c1", "model": "M", "choices": [{"message": {"content": "ok"}}]}),
    }])
    .await;
    let adapter = start_adapter(&upstream).await;

    let payload = json!({"model": "M", "input": "hi"}).to_string();
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(payload.as_bytes()).unwrap();
    let compressed = encoder.finish().unwrap();

    let out: Value = reqwest::Client::new()
        .post(responses_url(&adapter))
        .header("content-type", "application/json")
        .header("content-encoding", "gzip")
        .body(compressed)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(out["output_text"], json!("ok"));
    assert_eq!(upstream.requests()[0]["model"], json!("M"));
    adapter.close().await;
}

#[tokio::test]
async fn accepts_zstd_encoded_requests() {
    let upstream = MockUpstream::start(vec![UpstreamScript::Json {
        status: 200,
        body: json!({"id": "c1", "model": "M", "choices": [{"message": {"content": "ok"}}]}),
    }])
    .await;
    let adapter = start_adapter(&upstream).await;

    let payload = json!({"model": "M", "input": "hi"}).to_string();
    let compressed = zstd::encode_all(payload.as_bytes(), 0).unwrap();

    let out: Value = reqwest::Client::new()
        .post(responses_url(&adapter))
        .header("content-type", "application/json")
        .header("content-encoding", "zstd")
        .body(compressed)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(out["output_text"], json!("ok"));
    adapter.close().await;
}

#[tokio::test]
async fn recovers_double_encoded_bodies() {
    let upstream = MockUpstream::start(vec![UpstreamScript::Json {
        status: 200,
        body: json!({"id": "c1", "model": "M", "choices": [{"message": {"content": "ok"}}]}),
    }])
    .await;
    let adapter = start_adapter(&upstream).await;

    let inner = json!({"model": "M", "input": "hi"}).to_string();
    let double_encoded = serde_json::to_string(&inner).unwrap();

    let response = reqwest::Client::new()
        .post(responses_url(&adapter))
        .header("content-type", "application/json")
        .body(double_encoded)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(upstream.requests()[0]["model"], json!("M"));
    adapter.close().await;
}

#[tokio::test]
async fn function_call_history_reaches_the_upstream_in_chat_shape() {
    let upstream = MockUpstream::start(vec![UpstreamScript::Json {
        status: 200,
        body: json!({"id": "c1", "model": "M", "choices": [{"message": {"content": "done"}}]}),
    }])
    .await;
    let adapter = start_adapter(&upstream).await;

    reqwest::Client::new()
        .post(responses_url(&adapter))
        .json(&json!({
            "model": "M",
            "input": [
                {"type": "function_call", "call_id": "c", "name": "sum", "arguments": "{\"a\":1}"},
                {"type": "function_call_output", "call_id": "c", "output": "3"},
            ],
        }))
        .send()
        .await
        .unwrap();

    let messages = upstream.requests()[0]["messages"].as_array().unwrap().clone();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], json!("assistant"));
    assert_eq!(messages[0]["tool_calls"][0]["id"], json!("c"));
    assert_eq!(messages[0]["tool_calls"][0]["function"]["name"], json!("sum"));
    assert_eq!(messages[1], json!({"role": "tool", "tool_call_id": "c", "content": "3"}));
    adapter.close().await;
}
