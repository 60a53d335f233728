use serde_json::Value;

use crelay_protocol::sse::data_payload;

use crate::auth::Persona;

const INPUT_OFFSET: i64 = 14;
const BEDROCK_MSG_PREFIX: &str = "msg_bdrk_";
const BEDROCK_TOOL_PREFIX: &str = "toolu_bdrk_";

/// Pure persona-dependent rewrite of an already-obtained response. For SSE
/// it is line-oriented: `data:` payloads are parsed, transformed and
/// reserialized; everything else passes through verbatim.
pub struct ResponseShaper {
    persona: Persona,
    apply_input_offset: bool,
}

impl ResponseShaper {
    pub fn new(persona: Persona, apply_input_offset: bool) -> Self {
        Self {
            persona,
            apply_input_offset,
        }
    }

    pub fn shape_body(&self, body: &str) -> String {
        match serde_json::from_str::<Value>(body) {
            Ok(mut value) => {
                self.shape_value(&mut value);
                value.to_string()
            }
            Err(_) => body.to_string(),
        }
    }

    pub fn shape_sse_line(&self, line: &str) -> String {
        let Some(payload) = data_payload(line) else {
            return line.to_string();
        };
        if payload == "[DONE]" {
            return line.to_string();
        }
        match serde_json::from_str::<Value>(payload) {
            Ok(mut value) => {
                self.shape_value(&mut value);
                format!("data: {value}")
            }
            Err(_) => line.to_string(),
        }
    }

    pub fn shape_value(&self, value: &mut Value) {
        self.shape_envelope(value);
        // SSE message_start nests the message one level down.
        if let Some(message) = value.get_mut("message") {
            self.shape_envelope(message);
        }
    }

    fn shape_envelope(&self, value: &mut Value) {
        if matches!(self.persona, Persona::Aws | Persona::Databricks) {
            rewrite_ids(value);
        }
        if let Some(usage) = value.get_mut("usage") {
            self.rewrite_usage(usage);
        }
    }

    fn rewrite_usage(&self, usage: &mut Value) {
        let Some(input) = usage.get("input_tokens").and_then(Value::as_i64) else {
            return;
        };
        match self.persona {
            Persona::Cc | Persona::Anthropic | Persona::Aws => {
                usage["input_tokens"] = self.offset(input).into();
            }
            Persona::Databricks => {
                let cache_read = usage
                    .get("cache_read_input_tokens")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                let cache_creation = usage
                    .get("cache_creation_input_tokens")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                usage["input_tokens"] = self.offset(input + cache_read + cache_creation).into();
                if usage.get("cache_read_input_tokens").is_some() {
                    usage["cache_read_input_tokens"] = 0.into();
                }
                if usage.get("cache_creation_input_tokens").is_some() {
                    usage["cache_creation_input_tokens"] = 0.into();
                }
            }
        }
    }

    fn offset(&self, input: i64) -> i64 {
        if self.apply_input_offset && input > INPUT_OFFSET {
            input - INPUT_OFFSET
        } else {
            input
        }
    }
}

fn rewrite_ids(value: &mut Value) {
    if let Some(id) = value.get("id").and_then(Value::as_str) {
        if let Some(rest) = id.strip_prefix("msg_") {
            if !id.starts_with(BEDROCK_MSG_PREFIX) {
                value["id"] = format!("{BEDROCK_MSG_PREFIX}{rest}").into();
            }
        }
    }
    if let Some(content) = value.get_mut("content").and_then(Value::as_array_mut) {
        for item in content {
            if item.get("type").and_then(Value::as_str) != Some("tool_use") {
                continue;
            }
            if let Some(id) = item.get("id").and_then(Value::as_str) {
                if let Some(rest) = id.strip_prefix("toolu_") {
                    if !id.starts_with(BEDROCK_TOOL_PREFIX) {
                        item["id"] = format!("{BEDROCK_TOOL_PREFIX}{rest}").into();
                    }
                }
            }
        }
    }
}
