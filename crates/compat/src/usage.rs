//! Token usage mapping between Chat Completions and Responses shapes.
//!
//! Gateways disagree on where cached and reasoning token counts live
//! (top-level, `prompt_tokens_details`, `input_tokens_details`, …), so the
//! mapping probes every known location and settles on one canonical record.

use serde_json::{Map, Value, json};

use crate::chat::{int_field, map_field, nested_int};

/// Canonical usage counters. Consumers of the Responses dialect require all
/// five fields at the top level, zero or not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct UsageRecord {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub cached_input_tokens: i64,
    pub reasoning_output_tokens: i64,
}

impl UsageRecord {
    fn is_zero(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.total_tokens == 0
            && self.cached_input_tokens == 0
            && self.reasoning_output_tokens == 0
    }

    fn to_value(self) -> Value {
        let mut out = Map::new();
        out.insert("input_tokens".into(), json!(self.input_tokens));
        out.insert("output_tokens".into(), json!(self.output_tokens));
        out.insert("total_tokens".into(), json!(self.total_tokens));
        out.insert("cached_input_tokens".into(), json!(self.cached_input_tokens));
        out.insert(
            "reasoning_output_tokens".into(),
            json!(self.reasoning_output_tokens),
        );
        // Legacy consumers read the detail maps instead of the flat fields.
        if self.cached_input_tokens > 0 {
            out.insert(
                "input_tokens_details".into(),
                json!({"cached_tokens": self.cached_input_tokens}),
            );
        }
        if self.reasoning_output_tokens > 0 {
            out.insert(
                "output_tokens_details".into(),
                json!({"reasoning_tokens": self.reasoning_output_tokens}),
            );
        }
        Value::Object(out)
    }
}

/// Maps the `usage` object of a Chat payload (or of a nested `response`) to
/// the Responses usage shape. Returns `None` when no counter is non-zero.
pub(crate) fn chat_usage_to_responses_usage(payload: &Map<String, Value>) -> Option<Value> {
    let usage = map_field(payload, "usage")
        .filter(|m| !m.is_empty())
        .or_else(|| {
            map_field(payload, "response")
                .and_then(|r| map_field(r, "usage"))
                .filter(|m| !m.is_empty())
        })?;

    let mut input = int_field(usage, "input_tokens");
    if input == 0 {
        input = int_field(usage, "prompt_tokens");
    }
    let mut output = int_field(usage, "output_tokens");
    if output == 0 {
        output = int_field(usage, "completion_tokens");
    }
    let mut total = int_field(usage, "total_tokens");
    if total == 0 && (input > 0 || output > 0) {
        total = input + output;
    }

    let mut cached = int_field(usage, "cached_tokens");
    if cached == 0 {
        cached = int_field(usage, "cached_input_tokens");
    }
    if cached == 0 {
        cached = nested_int(usage, "prompt_tokens_details", "cached_tokens");
    }
    if cached == 0 {
        cached = nested_int(usage, "input_tokens_details", "cached_tokens");
    }

    let mut reasoning = int_field(usage, "reasoning_tokens");
    if reasoning == 0 {
        reasoning = int_field(usage, "reasoning_output_tokens");
    }
    if reasoning == 0 {
        reasoning = nested_int(usage, "completion_tokens_details", "reasoning_tokens");
    }
    if reasoning == 0 {
        reasoning = nested_int(usage, "output_tokens_details", "reasoning_tokens");
    }

    let record = UsageRecord {
        input_tokens: input,
        output_tokens: output,
        total_tokens: total,
        cached_input_tokens: cached,
        reasoning_output_tokens: reasoning,
    };
    if record.is_zero() {
        return None;
    }
    Some(record.to_value())
}

/// Merges a later usage snapshot into an accumulated one, preferring non-zero
/// incoming counters. Nested detail maps are rebuilt from the incoming
/// values only; a detail key the incoming snapshot does not refresh is
/// omitted rather than carried forward stale.
pub(crate) fn merge_responses_usage(base: Value, incoming: Value) -> Value {
    let Some(base_map) = base.as_object().filter(|m| !m.is_empty()) else {
        return incoming;
    };
    let empty = Map::new();
    let incoming_map = incoming.as_object().unwrap_or(&empty);

    let mut out = Map::new();

    for key in ["input_tokens", "output_tokens", "total_tokens"] {
        let mut v = int_field(base_map, key);
        let inc = int_field(incoming_map, key);
        if inc > 0 {
            v = inc;
        }
        out.insert(key.into(), json!(v));
    }

    let mut cached = int_field(base_map, "cached_input_tokens");
    if int_field(incoming_map, "cached_input_tokens") > 0 {
        cached = int_field(incoming_map, "cached_input_tokens");
    }
    out.insert("cached_input_tokens".into(), json!(cached));
    let inc_cached_detail = nested_int(incoming_map, "input_tokens_details", "cached_tokens");
    if inc_cached_detail > 0 {
        out.insert("cached_input_tokens".into(), json!(inc_cached_detail));
        out.insert(
            "input_tokens_details".into(),
            json!({"cached_tokens": inc_cached_detail}),
        );
    }

    let mut reasoning = int_field(base_map, "reasoning_output_tokens");
    if int_field(incoming_map, "reasoning_output_tokens") > 0 {
        reasoning = int_field(incoming_map, "reasoning_output_tokens");
    }
    out.insert("reasoning_output_tokens".into(), json!(reasoning));
    let inc_reasoning_detail = nested_int(incoming_map, "output_tokens_details", "reasoning_tokens");
    if inc_reasoning_detail > 0 {
        out.insert("reasoning_output_tokens".into(), json!(inc_reasoning_detail));
        out.insert(
            "output_tokens_details".into(),
            json!({"reasoning_tokens": inc_reasoning_detail}),
        );
    }

    Value::Object(out)
}

/// One-line usage summary for the diagnostic log.
pub(crate) fn format_usage_for_log(usage: &Value) -> String {
    let empty = Map::new();
    let m = usage.as_object().unwrap_or(&empty);
    let mut cached = int_field(m, "cached_input_tokens");
    if cached == 0 {
        cached = nested_int(m, "input_tokens_details", "cached_tokens");
    }
    let mut reasoning = int_field(m, "reasoning_output_tokens");
    if reasoning == 0 {
        reasoning = nested_int(m, "output_tokens_details", "reasoning_tokens");
    }
    format!(
        "usage input={} output={} total={} cached={} reasoning={}",
        int_field(m, "input_tokens"),
        int_field(m, "output_tokens"),
        int_field(m, "total_tokens"),
        cached,
        reasoning,
    )
}
