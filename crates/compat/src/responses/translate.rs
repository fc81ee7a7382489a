//! Responses request → Chat Completions request translation.

use std::collections::HashMap;

use serde_json::{Map, Value, json};

use crate::chat::{bool_field, int_value, normalize_content, str_field};

/// Maps a Responses request to a Chat Completions request. Unknown input is
/// never rejected here; anything unusable degrades to an empty user turn.
pub(crate) fn responses_to_chat_completions(req: &Map<String, Value>) -> Map<String, Value> {
    let mut model = str_field(req, "model").to_string();
    if model.is_empty() {
        model = "unknown".to_string();
    }
    let mut messages = responses_input_to_messages(req.get("input"));
    if messages.is_empty() {
        messages = vec![json!({"role": "user", "content": ""})];
    }

    let mut out = Map::new();
    out.insert("model".into(), Value::String(model));
    out.insert("messages".into(), Value::Array(messages));
    out.insert("stream".into(), Value::Bool(bool_field(req, "stream")));

    if let Some(v) = req.get("max_output_tokens") {
        if v.is_number() {
            out.insert("max_tokens".into(), json!(int_value(v)));
        }
    }
    for key in ["temperature", "top_p", "stop"] {
        if let Some(v) = req.get(key) {
            out.insert(key.into(), v.clone());
        }
    }
    if let Some(v) = req.get("tools") {
        let tools = responses_tools_to_chat_tools(v);
        if !tools.is_empty() {
            out.insert("tools".into(), Value::Array(tools));
        }
    }
    if let Some(v) = req.get("tool_choice") {
        if let Some(tc) = responses_tool_choice_to_chat(v) {
            out.insert("tool_choice".into(), tc);
        }
    }
    out
}

/// Chat Completions accepts only function tools; the Responses built-ins
/// (web search, computer use, …) are dropped.
fn responses_tools_to_chat_tools(raw: &Value) -> Vec<Value> {
    let Some(items) = raw.as_array() else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Some(m) = item.as_object() else { continue };
        if str_field(m, "type") != "function" {
            continue;
        }
        let mut function = Map::new();
        let name = str_field(m, "name");
        if !name.is_empty() {
            function.insert("name".into(), Value::String(name.to_string()));
        }
        let description = str_field(m, "description");
        if !description.is_empty() {
            function.insert("description".into(), Value::String(description.to_string()));
        }
        if let Some(params) = m.get("parameters") {
            function.insert("parameters".into(), params.clone());
        }
        if function.is_empty() {
            continue;
        }
        out.push(json!({"type": "function", "function": function}));
    }
    out
}

fn responses_tool_choice_to_chat(raw: &Value) -> Option<Value> {
    match raw {
        Value::String(s) => match s.as_str() {
            "auto" | "none" | "required" => Some(raw.clone()),
            _ => None,
        },
        Value::Object(m) => {
            if str_field(m, "type") != "function" {
                return None;
            }
            let mut name = str_field(m, "name");
            if name.is_empty() {
                name = m
                    .get("function")
                    .and_then(Value::as_object)
                    .map(|f| str_field(f, "name"))
                    .unwrap_or("");
            }
            if name.is_empty() {
                return None;
            }
            Some(json!({"type": "function", "function": {"name": name}}))
        }
        _ => None,
    }
}

#[derive(Default, Clone)]
struct PendingToolCall {
    name: String,
    arguments: String,
}

/// A tool result must be preceded by the assistant turn that issued the
/// call, so assistant tool_calls are remembered here and the assistant turn
/// is synthesized immediately before each tool message.
fn append_synthetic_assistant_tool_call(out: &mut Vec<Value>, call_id: &str, call: &PendingToolCall) {
    if call_id.is_empty() {
        return;
    }
    let name = if call.name.is_empty() { "unknown_tool" } else { &call.name };
    let arguments = if call.arguments.is_empty() { "{}" } else { &call.arguments };
    out.push(json!({
        "role": "assistant",
        "content": "",
        "tool_calls": [{
            "id": call_id,
            "type": "function",
            "function": {"name": name, "arguments": arguments},
        }],
    }));
}

fn responses_input_to_messages(input: Option<&Value>) -> Vec<Value> {
    let input = match input {
        None | Some(Value::Null) => return Vec::new(),
        Some(v) => v,
    };
    let items = match input {
        Value::String(s) => {
            return vec![json!({"role": "user", "content": s})];
        }
        Value::Array(items) => items,
        other => {
            let content = serde_json::to_string(other).unwrap_or_default();
            return vec![json!({"role": "user", "content": content})];
        }
    };

    let mut out = Vec::with_capacity(items.len());
    let mut pending: HashMap<String, PendingToolCall> = HashMap::new();

    for item in items {
        let Some(msg) = item.as_object() else { continue };
        match str_field(msg, "type") {
            "function_call_output" => {
                let mut call_id = str_field(msg, "call_id");
                if call_id.is_empty() {
                    call_id = str_field(msg, "tool_call_id");
                }
                if call_id.is_empty() {
                    continue;
                }
                let mut output = normalize_content(msg.get("output").unwrap_or(&Value::Null));
                if output.is_empty() {
                    output = normalize_content(msg.get("content").unwrap_or(&Value::Null));
                }
                if output.is_empty() {
                    output = "{}".to_string();
                }
                let call = pending.get(call_id).cloned().unwrap_or_default();
                append_synthetic_assistant_tool_call(&mut out, call_id, &call);
                out.push(json!({"role": "tool", "tool_call_id": call_id, "content": output}));
                pending.remove(call_id);
                continue;
            }
            "function_call" => {
                let mut call_id = str_field(msg, "call_id");
                if call_id.is_empty() {
                    call_id = str_field(msg, "id");
                }
                if call_id.is_empty() {
                    continue;
                }
                pending.insert(
                    call_id.to_string(),
                    PendingToolCall {
                        name: str_field(msg, "name").to_string(),
                        arguments: str_field(msg, "arguments").to_string(),
                    },
                );
                continue;
            }
            _ => {}
        }

        let mut role = str_field(msg, "role");
        if role.is_empty() {
            role = "user";
        }
        if role == "developer" {
            role = "system";
        }
        if !matches!(role, "system" | "user" | "assistant" | "tool") {
            role = "user";
        }

        if role == "assistant" {
            if let Some(raw_calls) = msg.get("tool_calls").and_then(Value::as_array) {
                if !raw_calls.is_empty() {
                    let mut recorded = 0usize;
                    for raw_call in raw_calls {
                        let Some(tc) = raw_call.as_object() else { continue };
                        let call_type = str_field(tc, "type");
                        if !call_type.is_empty() && call_type != "function" {
                            continue;
                        }
                        let mut id = str_field(tc, "id").to_string();
                        if id.is_empty() {
                            id = format!("call_{}", crate::chat::now_nanos());
                        }
                        let function = tc.get("function").and_then(Value::as_object);
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
                        pending.insert(
                            id,
                            PendingToolCall {
                                name: name.to_string(),
                                arguments,
                            },
                        );
                        recorded += 1;
                    }
                    if recorded > 0 {
                        // The assistant turn is synthesized later, right
                        // before its tool result.
                        continue;
                    }
                }
            }
        }

        let mut content = normalize_content(msg.get("content").unwrap_or(&Value::Null));
        if content.is_empty() {
            let text = str_field(msg, "text");
            if !text.is_empty() {
                content = text.to_string();
            }
        }

        if role == "tool" {
            let mut call_id = str_field(msg, "tool_call_id");
            if call_id.is_empty() {
                call_id = str_field(msg, "call_id");
            }
            if call_id.is_empty() {
                continue;
            }
            if content.is_empty() {
                content = "{}".to_string();
            }
            let call = pending.get(call_id).cloned().unwrap_or_default();
            append_synthetic_assistant_tool_call(&mut out, call_id, &call);
            out.push(json!({"role": "tool", "tool_call_id": call_id, "content": content}));
            pending.remove(call_id);
            continue;
        }

        if content.is_empty() {
            continue;
        }
        out.push(json!({"role": role, "content": content}));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn string_input_becomes_a_user_message() {
        let req = obj(json!({
            "model": "glm-5:cloud",
            "input": "hello",
            "stream": true,
            "max_output_tokens": 32,
        }));
        let out = responses_to_chat_completions(&req);
        assert_eq!(out["model"], "glm-5:cloud");
        assert_eq!(out["stream"], json!(true));
        assert_eq!(out["max_tokens"], json!(32));
        assert_eq!(out["messages"], json!([{"role": "user", "content": "hello"}]));
    }

    #[test]
    fn missing_model_and_input_get_defaults() {
        let out = responses_to_chat_completions(&obj(json!({})));
        assert_eq!(out["model"], "unknown");
        assert_eq!(out["stream"], json!(false));
        assert_eq!(out["messages"], json!([{"role": "user", "content": ""}]));
    }

    #[test]
    fn tools_are_mapped_and_builtins_filtered() {
        let req = obj(json!({
            "model": "GLM-4.7",
            "input": "hello",
            "tools": [
                {
                    "type": "function",
                    "name": "sum",
                    "description": "add numbers",
                    "parameters": {"type": "object"},
                },
                {"type": "web_search_preview"},
            ],
            "tool_choice": {"type": "function", "name": "sum"},
        }));
        let out = responses_to_chat_completions(&req);
        assert_eq!(
            out["tools"],
            json!([{
                "type": "function",
                "function": {
                    "name": "sum",
                    "description": "add numbers",
                    "parameters": {"type": "object"},
                },
            }])
        );
        assert_eq!(
            out["tool_choice"],
            json!({"type": "function", "function": {"name": "sum"}})
        );
    }

    #[test]
    fn tool_choice_strings_pass_through_when_known() {
        for choice in ["auto", "none", "required"] {
            let req = obj(json!({"input": "x", "tool_choice": choice}));
            assert_eq!(responses_to_chat_completions(&req)["tool_choice"], json!(choice));
        }
        let req = obj(json!({"input": "x", "tool_choice": "weird"}));
        assert!(!responses_to_chat_completions(&req).contains_key("tool_choice"));
    }

    #[test]
    fn array_input_joins_text_parts() {
        let input = json!([{
            "role": "user",
            "content": [
                {"type": "input_text", "text": "first"},
                {"type": "input_text", "text": "second"},
            ],
        }]);
        let msgs = responses_input_to_messages(Some(&input));
        assert_eq!(msgs, vec![json!({"role": "user", "content": "first\nsecond"})]);
    }

    #[test]
    fn developer_role_maps_to_system_and_unknown_to_user() {
        let input = json!([
            {"role": "developer", "content": "be concise"},
            {"role": "critic", "content": "hm"},
        ]);
        let msgs = responses_input_to_messages(Some(&input));
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[1]["role"], "user");
    }

    #[test]
    fn function_call_output_synthesizes_the_assistant_turn() {
        let input = json!([
            {"type": "function_call", "call_id": "c", "name": "sum", "arguments": "{\"a\":1}"},
            {"type": "function_call_output", "call_id": "c", "output": "3"},
        ]);
        let msgs = responses_input_to_messages(Some(&input));
        assert_eq!(
            msgs,
            vec![
                json!({
                    "role": "assistant",
                    "content": "",
                    "tool_calls": [{
                        "id": "c",
                        "type": "function",
                        "function": {"name": "sum", "arguments": "{\"a\":1}"},
                    }],
                }),
                json!({"role": "tool", "tool_call_id": "c", "content": "3"}),
            ]
        );
    }

    #[test]
    fn tool_role_message_gets_a_synthetic_assistant_with_placeholder() {
        let input = json!([{"role": "tool", "tool_call_id": "call_456", "content": "ok"}]);
        let msgs = responses_input_to_messages(Some(&input));
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0]["role"], "assistant");
        assert_eq!(msgs[0]["tool_calls"][0]["function"]["name"], "unknown_tool");
        assert_eq!(msgs[1], json!({"role": "tool", "tool_call_id": "call_456", "content": "ok"}));
    }

    #[test]
    fn assistant_tool_calls_are_recorded_but_not_emitted() {
        let input = json!([
            {
                "role": "assistant",
                "tool_calls": [{
                    "id": "call_9",
                    "type": "function",
                    "function": {"name": "sum", "arguments": "{}"},
                }],
            },
            {"type": "function_call_output", "call_id": "call_9", "output": "4"},
        ]);
        let msgs = responses_input_to_messages(Some(&input));
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0]["tool_calls"][0]["id"], "call_9");
        assert_eq!(msgs[0]["tool_calls"][0]["function"]["name"], "sum");
        assert_eq!(msgs[1]["role"], "tool");
    }

    #[test]
    fn empty_tool_output_defaults_to_braces() {
        let input = json!([
            {"type": "function_call", "call_id": "c", "name": "sum", "arguments": "{}"},
            {"type": "function_call_output", "call_id": "c", "output": ""},
        ]);
        let msgs = responses_input_to_messages(Some(&input));
        assert_eq!(msgs[1]["content"], "{}");
    }

    #[test]
    fn scalar_input_is_serialized() {
        let msgs = responses_input_to_messages(Some(&json!(42)));
        assert_eq!(msgs, vec![json!({"role": "user", "content": "42"})]);
    }
}
