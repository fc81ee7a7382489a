//! Anthropic Messages ↔ Chat Completions translation.

use serde_json::{Map, Value, json};

use crate::chat::{
    extract_full_text, extract_tool_calls, int_value, normalize_content, now_nanos, str_field,
};

/// Maps an Anthropic Messages request to a Chat Completions request.
pub(crate) fn anthropic_to_chat_completions(req: &Map<String, Value>) -> Map<String, Value> {
    let mut model = str_field(req, "model").to_string();
    if model.is_empty() {
        model = "unknown".to_string();
    }

    let mut out = Map::new();
    out.insert("model".into(), Value::String(model));
    out.insert(
        "messages".into(),
        Value::Array(anthropic_messages_to_chat_messages(req)),
    );
    out.insert("stream".into(), Value::Bool(false));

    if let Some(v) = req.get("max_tokens") {
        if v.is_number() && int_value(v) > 0 {
            out.insert("max_tokens".into(), json!(int_value(v)));
        }
    }
    if let Some(v) = req.get("temperature") {
        out.insert("temperature".into(), v.clone());
    }
    if let Some(v) = req.get("top_p") {
        out.insert("top_p".into(), v.clone());
    }
    if let Some(v) = req.get("stop_sequences") {
        out.insert("stop".into(), v.clone());
    }
    let tools = anthropic_tools_to_chat_tools(req.get("tools"));
    if !tools.is_empty() {
        out.insert("tools".into(), Value::Array(tools));
    }
    if let Some(tc) = anthropic_tool_choice_to_chat(req.get("tool_choice")) {
        out.insert("tool_choice".into(), tc);
    }
    out
}

fn anthropic_messages_to_chat_messages(req: &Map<String, Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(8);
    let system = anthropic_system_to_string(req.get("system"));
    if !system.is_empty() {
        out.push(json!({"role": "system", "content": system}));
    }

    let items = req.get("messages").and_then(Value::as_array);
    for raw in items.into_iter().flatten() {
        let Some(msg) = raw.as_object() else { continue };
        let mut role = str_field(msg, "role");
        if role.is_empty() {
            role = "user";
        }
        let (text, tool_calls, tool_results) =
            anthropic_content_to_chat_parts(msg.get("content").unwrap_or(&Value::Null));

        if role == "assistant" {
            let mut assistant = Map::new();
            assistant.insert("role".into(), json!("assistant"));
            assistant.insert("content".into(), Value::String(text));
            if !tool_calls.is_empty() {
                assistant.insert("tool_calls".into(), Value::Array(tool_calls));
            }
            out.push(Value::Object(assistant));
            continue;
        }
        if !text.is_empty() {
            out.push(json!({"role": role, "content": text}));
        }
        out.extend(tool_results);
    }

    if out.is_empty() {
        return vec![json!({"role": "user", "content": ""})];
    }
    out
}

fn anthropic_system_to_string(raw: Option<&Value>) -> String {
    match raw {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Array(items)) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                let Some(m) = item.as_object() else { continue };
                if str_field(m, "type") == "text" {
                    let text = str_field(m, "text");
                    if !text.is_empty() {
                        parts.push(text);
                    }
                }
            }
            parts.join("\n")
        }
        Some(other) => normalize_content(other),
    }
}

/// Splits typed content blocks into plain text, assistant `tool_calls`, and
/// standalone `tool` role messages for `tool_result` blocks.
fn anthropic_content_to_chat_parts(raw: &Value) -> (String, Vec<Value>, Vec<Value>) {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls = Vec::new();
    let mut tool_results = Vec::new();

    match raw {
        Value::String(s) => return (s.clone(), Vec::new(), Vec::new()),
        Value::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                let Some(m) = item.as_object() else { continue };
                match str_field(m, "type") {
                    "text" | "input_text" | "output_text" => {
                        let text = str_field(m, "text");
                        if !text.is_empty() {
                            text_parts.push(text);
                        }
                    }
                    "tool_use" => {
                        let name = str_field(m, "name");
                        if name.is_empty() {
                            continue;
                        }
                        let mut id = str_field(m, "id").to_string();
                        if id.is_empty() {
                            id = format!("call_{}_{idx}", now_nanos());
                        }
                        let arguments = m
                            .get("input")
                            .map(|input| serde_json::to_string(input).unwrap_or_else(|_| "{}".into()))
                            .unwrap_or_else(|| "{}".into());
                        tool_calls.push(json!({
                            "id": id,
                            "type": "function",
                            "function": {"name": name, "arguments": arguments},
                        }));
                    }
                    "tool_result" => {
                        let tool_call_id = str_field(m, "tool_use_id");
                        if tool_call_id.is_empty() {
                            continue;
                        }
                        let mut content = normalize_content(m.get("content").unwrap_or(&Value::Null));
                        if content.is_empty() {
                            content = "{}".to_string();
                        }
                        tool_results.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_call_id,
                            "content": content,
                        }));
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    (text_parts.join("\n"), tool_calls, tool_results)
}

fn anthropic_tools_to_chat_tools(raw: Option<&Value>) -> Vec<Value> {
    let Some(items) = raw.and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Some(m) = item.as_object() else { continue };
        let name = str_field(m, "name");
        if name.is_empty() {
            continue;
        }
        let mut function = Map::new();
        function.insert("name".into(), Value::String(name.to_string()));
        let description = str_field(m, "description");
        if !description.is_empty() {
            function.insert("description".into(), Value::String(description.to_string()));
        }
        if let Some(schema) = m.get("input_schema") {
            function.insert("parameters".into(), schema.clone());
        }
        out.push(json!({"type": "function", "function": function}));
    }
    out
}

fn anthropic_tool_choice_to_chat(raw: Option<&Value>) -> Option<Value> {
    match raw? {
        Value::String(s) => match s.as_str() {
            "auto" => Some(json!("auto")),
            "any" => Some(json!("required")),
            "none" => Some(json!("none")),
            _ => None,
        },
        Value::Object(m) => match str_field(m, "type") {
            "auto" => Some(json!("auto")),
            "any" => Some(json!("required")),
            "tool" => {
                let name = str_field(m, "name");
                if name.is_empty() {
                    return None;
                }
                Some(json!({"type": "function", "function": {"name": name}}))
            }
            _ => None,
        },
        _ => None,
    }
}

/// Builds the Anthropic Message object from an upstream Chat response. Used
/// by the non-stream path and by the stream-from-message fallback.
pub(crate) fn chat_to_anthropic_message(
    chat_resp: &Map<String, Value>,
    requested_model: &str,
) -> Value {
    let mut id = str_field(chat_resp, "id").to_string();
    if id.is_empty() {
        id = format!("msg_{}", now_nanos());
    }
    let mut model = str_field(chat_resp, "model").to_string();
    if model.is_empty() {
        model = requested_model.to_string();
    }

    let text = extract_full_text(chat_resp);
    let tool_calls = extract_tool_calls(chat_resp);
    let mut content = Vec::with_capacity(1 + tool_calls.len());
    if !text.is_empty() {
        content.push(json!({"type": "text", "text": text}));
    }
    for (i, tc) in tool_calls.iter().enumerate() {
        let input = if tc.arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str::<Value>(&tc.arguments)
                .ok()
                .filter(Value::is_object)
                .unwrap_or_else(|| json!({}))
        };
        let mut id = tc.call_id.clone();
        if id.is_empty() {
            id = tc.id.clone();
        }
        if id.is_empty() {
            id = format!("toolu_{}_{i}", now_nanos());
        }
        content.push(json!({
            "type": "tool_use",
            "id": id,
            "name": tc.name,
            "input": input,
        }));
    }

    let usage = chat_resp.get("usage").and_then(Value::as_object);
    json!({
        "id": id,
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": chat_stop_reason(chat_resp, !tool_calls.is_empty()),
        "stop_sequence": null,
        "usage": {
            "input_tokens": usage.map(|u| crate::chat::int_field(u, "prompt_tokens")).unwrap_or(0),
            "output_tokens": usage.map(|u| crate::chat::int_field(u, "completion_tokens")).unwrap_or(0),
        },
    })
}

/// Chat `finish_reason` → Anthropic `stop_reason`; tool calls always win.
pub(crate) fn chat_stop_reason(chat_resp: &Map<String, Value>, has_tool_calls: bool) -> &'static str {
    if has_tool_calls {
        return "tool_use";
    }
    let finish_reason = chat_resp
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(Value::as_object)
        .map(|c0| str_field(c0, "finish_reason"))
        .unwrap_or("");
    match finish_reason {
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        _ => "end_turn",
    }
}
