use serde_json::Value;

use crate::sse::data_payload;

/// Upstream error text that signals an account-level rate limit even when
/// the HTTP status is not 429.
pub const RATE_LIMIT_NEEDLE: &str = "exceed your account's rate limit";

pub fn is_rate_limit_payload(text: &str) -> bool {
    text.to_ascii_lowercase().contains(RATE_LIMIT_NEEDLE)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamUsage {
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cache_creation_input_tokens: Option<i64>,
    pub cache_read_input_tokens: Option<i64>,
    pub model: Option<String>,
}

impl StreamUsage {
    fn complete(&self) -> bool {
        self.input_tokens.is_some() && self.output_tokens.is_some()
    }
}

/// Watches the SSE lines of one response: collects usage out of
/// `message_start` / `message_delta`, yields it exactly once, and flags
/// rate-limit error events.
#[derive(Debug, Default)]
pub struct UsageWatcher {
    usage: StreamUsage,
    emitted: bool,
    rate_limited: bool,
}

impl UsageWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one forwarded line. Returns the collected usage the first time
    /// both input and output counts are known; `None` afterwards.
    pub fn observe_line(&mut self, line: &str) -> Option<StreamUsage> {
        let payload = data_payload(line)?;
        if payload == "[DONE]" {
            return None;
        }
        let value: Value = serde_json::from_str(payload).ok()?;
        match value.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(message) = value.get("message") {
                    if let Some(model) = message.get("model").and_then(Value::as_str) {
                        self.usage.model = Some(model.to_string());
                    }
                    if let Some(usage) = message.get("usage") {
                        self.usage.input_tokens =
                            usage.get("input_tokens").and_then(Value::as_i64);
                        self.usage.cache_creation_input_tokens = usage
                            .get("cache_creation_input_tokens")
                            .and_then(Value::as_i64);
                        self.usage.cache_read_input_tokens = usage
                            .get("cache_read_input_tokens")
                            .and_then(Value::as_i64);
                    }
                }
            }
            Some("message_delta") => {
                if let Some(output) = value
                    .get("usage")
                    .and_then(|usage| usage.get("output_tokens"))
                    .and_then(Value::as_i64)
                {
                    self.usage.output_tokens = Some(output);
                }
            }
            Some("error") => {
                let message = value
                    .get("error")
                    .and_then(|error| error.get("message"))
                    .and_then(Value::as_str)
                    .or_else(|| value.get("message").and_then(Value::as_str))
                    .unwrap_or_default();
                if is_rate_limit_payload(message) {
                    self.rate_limited = true;
                }
            }
            _ => {}
        }

        if self.usage.complete() && !self.emitted {
            self.emitted = true;
            return Some(self.usage.clone());
        }
        None
    }

    pub fn rate_limit_detected(&self) -> bool {
        self.rate_limited
    }

    pub fn emitted(&self) -> bool {
        self.emitted
    }

    pub fn partial(&self) -> &StreamUsage {
        &self.usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: &str = r#"data: {"type":"message_start","message":{"model":"claude-sonnet-4-20250514","usage":{"input_tokens":100,"cache_creation_input_tokens":5,"cache_read_input_tokens":10}}}"#;
    const DELTA: &str = r#"data: {"type":"message_delta","usage":{"output_tokens":42}}"#;

    #[test]
    fn usage_is_emitted_exactly_once() {
        let mut watcher = UsageWatcher::new();
        assert_eq!(watcher.observe_line(START), None);
        let usage = watcher.observe_line(DELTA).unwrap();
        assert_eq!(usage.input_tokens, Some(100));
        assert_eq!(usage.output_tokens, Some(42));
        assert_eq!(usage.cache_creation_input_tokens, Some(5));
        assert_eq!(usage.cache_read_input_tokens, Some(10));
        assert_eq!(usage.model.as_deref(), Some("claude-sonnet-4-20250514"));

        // A second delta updates nothing outward.
        assert_eq!(watcher.observe_line(DELTA), None);
        assert!(watcher.emitted());
    }

    #[test]
    fn rate_limit_error_event_is_flagged() {
        let mut watcher = UsageWatcher::new();
        let line = r#"data: {"type":"error","error":{"type":"rate_limit_error","message":"You Exceed your account's Rate Limit."}}"#;
        watcher.observe_line(line);
        assert!(watcher.rate_limit_detected());
    }

    #[test]
    fn unrelated_errors_are_not_flagged() {
        let mut watcher = UsageWatcher::new();
        let line = r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        watcher.observe_line(line);
        assert!(!watcher.rate_limit_detected());
    }

    #[test]
    fn non_data_and_done_lines_are_ignored() {
        let mut watcher = UsageWatcher::new();
        assert_eq!(watcher.observe_line("event: ping"), None);
        assert_eq!(watcher.observe_line("data: [DONE]"), None);
        assert_eq!(watcher.observe_line("data: not-json"), None);
    }
}
