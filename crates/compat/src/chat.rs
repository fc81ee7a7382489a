//! Extraction primitives over loosely typed Chat Completions documents.
//!
//! Upstream gateways drift on field names and shapes, so everything here
//! operates on [`serde_json::Value`] trees and degrades to empty values
//! instead of failing. Only tool calls and their deltas get typed records.

use serde_json::{Map, Value};

/// A fully materialized tool call extracted from a non-stream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChatToolCall {
    pub id: String,
    pub call_id: String,
    pub name: String,
    /// JSON-encoded argument object, `"{}"` when the upstream sent none.
    pub arguments: String,
}

/// An incremental tool-call fragment from a stream chunk, accumulated by
/// `index` across chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChatToolCallDelta {
    pub index: i64,
    pub call_id: String,
    pub name: String,
    pub arguments_delta: String,
}

pub(crate) fn str_field<'a>(m: &'a Map<String, Value>, key: &str) -> &'a str {
    m.get(key).and_then(Value::as_str).unwrap_or("")
}

pub(crate) fn bool_field(m: &Map<String, Value>, key: &str) -> bool {
    m.get(key).and_then(Value::as_bool).unwrap_or(false)
}

pub(crate) fn int_value(v: &Value) -> i64 {
    if let Some(n) = v.as_i64() {
        n
    } else if let Some(n) = v.as_u64() {
        n as i64
    } else if let Some(n) = v.as_f64() {
        n as i64
    } else {
        0
    }
}

pub(crate) fn int_field(m: &Map<String, Value>, key: &str) -> i64 {
    m.get(key).map(int_value).unwrap_or(0)
}

pub(crate) fn map_field<'a>(m: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    m.get(key).and_then(Value::as_object)
}

/// Looks up `outer.key` where `outer` is itself an optional object field.
pub(crate) fn nested_int(m: &Map<String, Value>, outer: &str, key: &str) -> i64 {
    map_field(m, outer).map(|inner| int_field(inner, key)).unwrap_or(0)
}

/// Monotonic nanosecond stamp used to synthesize ids (`resp_…`, `fc_…`).
pub(crate) fn now_nanos() -> i128 {
    jiff::Timestamp::now().as_nanosecond()
}

/// Flattens arbitrary message content into plain text (§ content rules):
/// strings pass through, text-typed parts contribute their `text`, other
/// objects are re-serialized so nothing the client sent is silently lost.
pub(crate) fn normalize_content(raw: &Value) -> String {
    match raw {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Object(m) => {
            let item_type = str_field(m, "type");
            if matches!(item_type, "" | "input_text" | "output_text" | "text") {
                let text = str_field(m, "text");
                if !text.is_empty() {
                    return text.to_string();
                }
            }
            serde_json::to_string(m).unwrap_or_default()
        }
        Value::Array(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                let Some(m) = item.as_object() else { continue };
                if matches!(str_field(m, "type"), "input_text" | "output_text" | "text") {
                    let text = str_field(m, "text");
                    if !text.is_empty() {
                        parts.push(text);
                    }
                }
            }
            parts.join("\n")
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn first_choice(payload: &Map<String, Value>) -> Option<&Map<String, Value>> {
    payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(Value::as_object)
}

/// Full text of a non-stream response: first choice's `message.content`,
/// falling back to the legacy completions-style `choices[0].text`.
pub(crate) fn extract_full_text(payload: &Map<String, Value>) -> String {
    let Some(c0) = first_choice(payload) else {
        return String::new();
    };
    if let Some(msg) = map_field(c0, "message") {
        let text = normalize_content(msg.get("content").unwrap_or(&Value::Null));
        if !text.is_empty() {
            return text;
        }
    }
    normalize_content(c0.get("text").unwrap_or(&Value::Null))
}

/// Incremental text from a stream chunk: `delta.content`, then `delta.text`,
/// then the legacy `choices[0].text`.
pub(crate) fn extract_delta(chunk: &Map<String, Value>) -> String {
    let Some(c0) = first_choice(chunk) else {
        return String::new();
    };
    if let Some(delta) = map_field(c0, "delta") {
        let text = normalize_content(delta.get("content").unwrap_or(&Value::Null));
        if !text.is_empty() {
            return text;
        }
        let text = normalize_content(delta.get("text").unwrap_or(&Value::Null));
        if !text.is_empty() {
            return text;
        }
    }
    normalize_content(c0.get("text").unwrap_or(&Value::Null))
}

pub(crate) fn extract_reasoning_delta(chunk: &Map<String, Value>) -> String {
    let Some(c0) = first_choice(chunk) else {
        return String::new();
    };
    let Some(delta) = map_field(c0, "delta") else {
        return String::new();
    };
    normalize_content(delta.get("reasoning").unwrap_or(&Value::Null))
}

/// Tool calls of a full response message. Entries with a foreign `type` or a
/// missing function name are dropped; missing ids are synthesized.
pub(crate) fn extract_tool_calls(payload: &Map<String, Value>) -> Vec<ChatToolCall> {
    let Some(items) = first_choice(payload)
        .and_then(|c0| map_field(c0, "message"))
        .and_then(|msg| msg.get("tool_calls"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let Some(m) = item.as_object() else { continue };
        let call_type = str_field(m, "type");
        if !call_type.is_empty() && call_type != "function" {
            continue;
        }
        let mut id = str_field(m, "id").to_string();
        if id.is_empty() {
            id = format!("fc_{}_{i}", now_nanos());
        }
        let function = map_field(m, "function");
        let name = function.map(|f| str_field(f, "name")).unwrap_or("");
        if name.is_empty() {
            continue;
        }
        let mut arguments = function
            .map(|f| str_field(f, "arguments"))
            .unwrap_or("")
            .to_string();
        if arguments.is_empty() {
            arguments = "{}".to_string();
        }
        out.push(ChatToolCall {
            call_id: id.clone(),
            id,
            name: name.to_string(),
            arguments,
        });
    }
    out
}

/// Tool-call fragments of a stream chunk. `index` defaults to -1 when the
/// upstream omitted it; callers drop negative indices.
pub(crate) fn extract_tool_call_deltas(chunk: &Map<String, Value>) -> Vec<ChatToolCallDelta> {
    let Some(items) = first_choice(chunk)
        .and_then(|c0| map_field(c0, "delta"))
        .and_then(|delta| delta.get("tool_calls"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Some(m) = item.as_object() else { continue };
        let index = match m.get("index") {
            Some(v) if v.is_number() => int_value(v),
            _ => -1,
        };
        let function = map_field(m, "function");
        out.push(ChatToolCallDelta {
            index,
            call_id: str_field(m, "id").to_string(),
            name: function.map(|f| str_field(f, "name")).unwrap_or("").to_string(),
            arguments_delta: function
                .map(|f| str_field(f, "arguments"))
                .unwrap_or("")
                .to_string(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().expect("object literal").clone()
    }

    #[test]
    fn normalize_passes_strings_through() {
        assert_eq!(normalize_content(&json!("hello")), "hello");
        assert_eq!(normalize_content(&Value::Null), "");
    }

    #[test]
    fn normalize_takes_text_from_typed_parts() {
        assert_eq!(normalize_content(&json!({"type": "text", "text": "你好"})), "你好");
        assert_eq!(normalize_content(&json!({"type": "input_text", "text": "a"})), "a");
        assert_eq!(normalize_content(&json!({"text": "untyped"})), "untyped");
    }

    #[test]
    fn normalize_serializes_foreign_objects() {
        let got = normalize_content(&json!({"type": "image", "url": "x"}));
        let round: Value = serde_json::from_str(&got).unwrap();
        assert_eq!(round, json!({"type": "image", "url": "x"}));
    }

    #[test]
    fn normalize_joins_text_parts_of_arrays() {
        let raw = json!([
            {"type": "input_text", "text": "first"},
            {"type": "image", "url": "ignored"},
            {"type": "output_text", "text": "second"},
        ]);
        assert_eq!(normalize_content(&raw), "first\nsecond");
    }

    #[test]
    fn normalize_is_idempotent_on_its_own_output() {
        let inputs = [
            json!("plain"),
            json!({"type": "text", "text": "typed"}),
            json!([{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]),
            json!(true),
            json!(12.5),
        ];
        for input in inputs {
            let once = normalize_content(&input);
            let twice = normalize_content(&Value::String(once.clone()));
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn full_text_prefers_message_content() {
        let resp = obj(json!({
            "choices": [{"message": {"content": "hi"}, "text": "legacy"}]
        }));
        assert_eq!(extract_full_text(&resp), "hi");
    }

    #[test]
    fn full_text_falls_back_to_choice_text() {
        let resp = obj(json!({"choices": [{"text": "hello"}]}));
        assert_eq!(extract_full_text(&resp), "hello");
    }

    #[test]
    fn delta_falls_back_to_delta_text_then_choice_text() {
        let chunk = obj(json!({"choices": [{"delta": {"text": "你好"}}]}));
        assert_eq!(extract_delta(&chunk), "你好");

        let chunk = obj(json!({"choices": [{"text": "full"}]}));
        assert_eq!(extract_delta(&chunk), "full");
    }

    #[test]
    fn reasoning_delta_reads_delta_reasoning() {
        let chunk = obj(json!({"choices": [{"delta": {"reasoning": "thinking"}}]}));
        assert_eq!(extract_reasoning_delta(&chunk), "thinking");
        let chunk = obj(json!({"choices": [{"delta": {"content": "x"}}]}));
        assert_eq!(extract_reasoning_delta(&chunk), "");
    }

    #[test]
    fn tool_calls_require_a_name_and_default_arguments() {
        let resp = obj(json!({
            "choices": [{"message": {"tool_calls": [
                {"id": "call_1", "type": "function", "function": {"name": "sum"}},
                {"type": "function", "function": {"arguments": "{}"}},
                {"type": "custom", "function": {"name": "skipped"}},
            ]}}]
        }));
        let calls = extract_tool_calls(&resp);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].call_id, "call_1");
        assert_eq!(calls[0].name, "sum");
        assert_eq!(calls[0].arguments, "{}");
    }

    #[test]
    fn tool_calls_synthesize_missing_ids() {
        let resp = obj(json!({
            "choices": [{"message": {"tool_calls": [
                {"function": {"name": "sum", "arguments": "{\"a\":1}"}},
            ]}}]
        }));
        let calls = extract_tool_calls(&resp);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].id.starts_with("fc_"));
        assert_eq!(calls[0].call_id, calls[0].id);
    }

    #[test]
    fn tool_call_deltas_coerce_index_and_pass_fragments() {
        let chunk = obj(json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "sum", "arguments": "{\"a\":"}},
                {"function": {"arguments": "1}"}},
            ]}}]
        }));
        let deltas = extract_tool_call_deltas(&chunk);
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].index, 0);
        assert_eq!(deltas[0].call_id, "call_1");
        assert_eq!(deltas[0].name, "sum");
        assert_eq!(deltas[0].arguments_delta, "{\"a\":");
        assert_eq!(deltas[1].index, -1);
    }

    #[test]
    fn int_value_handles_number_variants() {
        assert_eq!(int_value(&json!(3)), 3);
        assert_eq!(int_value(&json!(3.9)), 3);
        assert_eq!(int_value(&json!("3")), 0);
    }
}
