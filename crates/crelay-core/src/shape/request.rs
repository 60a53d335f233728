use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};

use crelay_common::ModelEntry;

pub const CLAUDE_CODE_PRELUDE: &str =
    "You are Claude Code, Anthropic's official CLI for Claude.";

fn claude_cli_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"claude-cli/\d+\.\d+\.\d+").expect("static regex"))
}

/// A request is genuine Claude-Code iff the downstream user-agent matches
/// `claude-cli/<digits>.<digits>.<digits>` and the first `system` element is
/// a text block whose text equals the prelude exactly.
pub fn is_genuine_claude_code(user_agent: Option<&str>, body: &Value) -> bool {
    let ua_matches = user_agent
        .map(|ua| claude_cli_regex().is_match(ua))
        .unwrap_or(false);
    if !ua_matches {
        return false;
    }
    body.get("system")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .map(is_prelude_block)
        .unwrap_or(false)
}

fn is_prelude_block(item: &Value) -> bool {
    item.get("type").and_then(Value::as_str) == Some("text")
        && item.get("text").and_then(Value::as_str) == Some(CLAUDE_CODE_PRELUDE)
}

fn prelude_block() -> Value {
    json!({
        "type": "text",
        "text": CLAUDE_CODE_PRELUDE,
        "cache_control": {"type": "ephemeral"},
    })
}

/// Persona-independent request rewrites, applied to a deep copy of the
/// downstream body. Applying it twice yields the same result as once.
pub struct RequestShaper {
    model_limits: HashMap<String, u64>,
    operator_prompt: Option<String>,
}

impl RequestShaper {
    pub fn new(models: &[ModelEntry], operator_prompt: Option<String>) -> Self {
        let model_limits = models
            .iter()
            .filter_map(|entry| {
                entry
                    .max_output_tokens
                    .map(|limit| (entry.id.clone(), limit))
            })
            .collect();
        Self {
            model_limits,
            operator_prompt: operator_prompt.filter(|p| !p.trim().is_empty()),
        }
    }

    pub fn shape(&self, body: &Value, user_agent: Option<&str>) -> Value {
        let genuine = is_genuine_claude_code(user_agent, body);
        let mut shaped = body.clone();
        self.clamp_max_tokens(&mut shaped);
        scrub_cache_control_ttl(&mut shaped);
        if !genuine {
            normalize_system(&mut shaped);
        }
        self.append_operator_prompt(&mut shaped);
        drop_empty_system(&mut shaped);
        shaped
    }

    fn clamp_max_tokens(&self, body: &mut Value) {
        let Some(model) = body.get("model").and_then(Value::as_str) else {
            return;
        };
        let Some(limit) = self.model_limits.get(model).copied() else {
            return;
        };
        if let Some(requested) = body.get("max_tokens").and_then(Value::as_u64) {
            if requested > limit {
                body["max_tokens"] = json!(limit);
            }
        }
    }

    fn append_operator_prompt(&self, body: &mut Value) {
        let Some(prompt) = self.operator_prompt.as_deref() else {
            return;
        };
        let Some(items) = body.get_mut("system").and_then(Value::as_array_mut) else {
            return;
        };
        let exists = items
            .iter()
            .any(|item| item.get("text").and_then(Value::as_str) == Some(prompt));
        if !exists {
            items.push(json!({"type": "text", "text": prompt}));
        }
    }
}

/// Upstream rejects `ttl` inside cache_control for OAuth traffic; drop it
/// from system blocks and every message content block.
fn scrub_cache_control_ttl(body: &mut Value) {
    if let Some(items) = body.get_mut("system").and_then(Value::as_array_mut) {
        for item in items {
            scrub_one(item);
        }
    }
    if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
        for message in messages {
            if let Some(content) = message.get_mut("content").and_then(Value::as_array_mut) {
                for item in content {
                    scrub_one(item);
                }
            }
        }
    }
}

fn scrub_one(item: &mut Value) {
    if let Some(cache_control) = item
        .get_mut("cache_control")
        .and_then(Value::as_object_mut)
    {
        cache_control.remove("ttl");
    }
}

fn normalize_system(body: &mut Value) {
    let current = body.get("system").cloned();
    let normalized = match current {
        None => Some(json!([prelude_block()])),
        Some(Value::String(text)) if text == CLAUDE_CODE_PRELUDE => {
            Some(json!([prelude_block()]))
        }
        Some(Value::String(text)) => Some(json!([
            prelude_block(),
            {"type": "text", "text": text},
        ])),
        Some(Value::Array(items)) => {
            if items.first().map(is_prelude_block).unwrap_or(false) {
                None
            } else {
                let mut rebuilt = vec![prelude_block()];
                rebuilt.extend(items.into_iter().filter(|item| !is_prelude_block(item)));
                Some(Value::Array(rebuilt))
            }
        }
        Some(_) => None,
    };
    if let Some(system) = normalized {
        body["system"] = system;
    }
}

fn drop_empty_system(body: &mut Value) {
    let empty = match body.get("system") {
        Some(Value::String(text)) => text.trim().is_empty(),
        Some(Value::Array(items)) => !items.iter().any(|item| {
            item.get("text")
                .and_then(Value::as_str)
                .map(|text| !text.trim().is_empty())
                .unwrap_or(false)
        }),
        _ => false,
    };
    if empty {
        if let Some(obj) = body.as_object_mut() {
            obj.remove("system");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shaper() -> RequestShaper {
        RequestShaper::new(&[], None)
    }

    const CLI_UA: &str = "claude-cli/1.0.57 (external, cli)";

    #[test]
    fn genuine_request_keeps_its_system_untouched() {
        let body = json!({
            "model": "claude-sonnet-4-20250514",
            "system": [{"type": "text", "text": CLAUDE_CODE_PRELUDE}],
            "messages": [{"role": "user", "content": "ping"}],
        });
        assert!(is_genuine_claude_code(Some(CLI_UA), &body));
        let shaped = shaper().shape(&body, Some(CLI_UA));
        assert_eq!(shaped["system"], body["system"]);
    }

    #[test]
    fn non_genuine_client_gets_the_prelude_prepended() {
        let body = json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [{"role": "user", "content": "hi"}],
        });
        assert!(!is_genuine_claude_code(Some("curl/8"), &body));
        let shaped = shaper().shape(&body, Some("curl/8"));
        let system = shaped["system"].as_array().unwrap();
        assert_eq!(system[0]["text"], CLAUDE_CODE_PRELUDE);
        assert_eq!(system[0]["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn string_system_becomes_prelude_plus_original() {
        let body = json!({
            "model": "m",
            "system": "Answer in French.",
            "messages": [{"role": "user", "content": "hi"}],
        });
        let shaped = shaper().shape(&body, None);
        let system = shaped["system"].as_array().unwrap();
        assert_eq!(system.len(), 2);
        assert_eq!(system[0]["text"], CLAUDE_CODE_PRELUDE);
        assert_eq!(system[1]["text"], "Answer in French.");
    }

    #[test]
    fn string_system_equal_to_prelude_collapses_to_one_block() {
        let body = json!({
            "model": "m",
            "system": CLAUDE_CODE_PRELUDE,
            "messages": [],
        });
        let shaped = shaper().shape(&body, None);
        let system = shaped["system"].as_array().unwrap();
        assert_eq!(system.len(), 1);
        assert_eq!(system[0]["text"], CLAUDE_CODE_PRELUDE);
    }

    #[test]
    fn stray_prelude_blocks_are_deduplicated() {
        let body = json!({
            "model": "m",
            "system": [
                {"type": "text", "text": "other"},
                {"type": "text", "text": CLAUDE_CODE_PRELUDE},
            ],
            "messages": [],
        });
        let shaped = shaper().shape(&body, None);
        let system = shaped["system"].as_array().unwrap();
        assert_eq!(system.len(), 2);
        assert_eq!(system[0]["text"], CLAUDE_CODE_PRELUDE);
        assert_eq!(system[1]["text"], "other");
    }

    #[test]
    fn shaping_is_idempotent() {
        let bodies = [
            json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}),
            json!({"model": "m", "system": "custom", "messages": []}),
            json!({"model": "m", "system": [{"type": "text", "text": "x",
                "cache_control": {"type": "ephemeral", "ttl": "5m"}}], "messages": []}),
        ];
        let shaper = RequestShaper::new(&[], Some("operator note".into()));
        for body in bodies {
            let once = shaper.shape(&body, Some("curl/8"));
            let twice = shaper.shape(&once, Some("curl/8"));
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn cache_control_ttl_is_scrubbed_everywhere() {
        let body = json!({
            "model": "m",
            "system": [{"type": "text", "text": "s",
                "cache_control": {"type": "ephemeral", "ttl": "1h"}}],
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "hi",
                 "cache_control": {"type": "ephemeral", "ttl": "5m"}},
            ]}],
        });
        let shaped = shaper().shape(&body, None);
        let system = shaped["system"].as_array().unwrap();
        // The prelude was prepended; the original block moved to index 1.
        assert!(system[1]["cache_control"].get("ttl").is_none());
        assert_eq!(system[1]["cache_control"]["type"], "ephemeral");
        let content = shaped["messages"][0]["content"].as_array().unwrap();
        assert!(content[0]["cache_control"].get("ttl").is_none());
    }

    #[test]
    fn max_tokens_clamps_only_with_a_table_entry() {
        let models = vec![ModelEntry {
            id: "claude-sonnet-4-20250514".into(),
            max_output_tokens: Some(8192),
        }];
        let shaper = RequestShaper::new(&models, None);

        let body = json!({"model": "claude-sonnet-4-20250514", "max_tokens": 100000, "messages": []});
        assert_eq!(shaper.shape(&body, None)["max_tokens"], 8192);

        let body = json!({"model": "claude-sonnet-4-20250514", "max_tokens": 4096, "messages": []});
        assert_eq!(shaper.shape(&body, None)["max_tokens"], 4096);

        let body = json!({"model": "unknown-model", "max_tokens": 100000, "messages": []});
        assert_eq!(shaper.shape(&body, None)["max_tokens"], 100000);
    }

    #[test]
    fn operator_prompt_appends_once() {
        let shaper = RequestShaper::new(&[], Some("operator note".into()));
        let body = json!({"model": "m", "messages": []});
        let shaped = shaper.shape(&body, None);
        let system = shaped["system"].as_array().unwrap();
        assert_eq!(system.last().unwrap()["text"], "operator note");

        let again = shaper.shape(&shaped, None);
        let count = again["system"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|item| item["text"] == "operator note")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn ua_alone_is_not_genuine() {
        let body = json!({"model": "m", "messages": []});
        assert!(!is_genuine_claude_code(Some(CLI_UA), &body));
        let with_other_system = json!({
            "model": "m",
            "system": [{"type": "text", "text": "something else"}],
            "messages": [],
        });
        assert!(!is_genuine_claude_code(Some(CLI_UA), &with_other_system));
    }
}
