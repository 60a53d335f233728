use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use tracing::debug;

use crate::upstream::{UpstreamClient, UpstreamRequest};

/// Personas styled after metered gateways refuse requests under this count.
pub const TOKEN_FLOOR: u64 = 250;

const COUNT_TIMEOUT: Duration = Duration::from_secs(10);

/// Strip the request down to what the count endpoint accepts.
pub fn reduced_body(body: &Value) -> Value {
    let mut reduced = json!({
        "model": body.get("model").cloned().unwrap_or(Value::Null),
        "messages": body.get("messages").cloned().unwrap_or_else(|| json!([])),
    });
    if let Some(system) = body.get("system") {
        reduced["system"] = system.clone();
    }
    if let Some(tools) = body.get("tools") {
        reduced["tools"] = tools.clone();
    }
    reduced
}

/// Deterministic character estimate used when the upstream count call is
/// unavailable: every text payload in messages and system, at 3.5 chars per
/// token, rounded up.
pub fn estimate_tokens(body: &Value) -> u64 {
    let mut chars: u64 = 0;
    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        for message in messages {
            chars += content_chars(message.get("content"));
        }
    }
    match body.get("system") {
        Some(Value::String(text)) => chars += text.chars().count() as u64,
        Some(Value::Array(items)) => {
            for item in items {
                chars += text_block_chars(item);
            }
        }
        _ => {}
    }
    // ceil(chars / 3.5) without leaving integer arithmetic.
    (chars * 2).div_ceil(7)
}

fn content_chars(content: Option<&Value>) -> u64 {
    match content {
        Some(Value::String(text)) => text.chars().count() as u64,
        Some(Value::Array(items)) => items.iter().map(text_block_chars).sum(),
        _ => 0,
    }
}

fn text_block_chars(item: &Value) -> u64 {
    if item.get("type").and_then(Value::as_str) != Some("text") {
        return 0;
    }
    item.get("text")
        .and_then(Value::as_str)
        .map(|text| text.chars().count() as u64)
        .unwrap_or(0)
}

/// Asks the upstream count endpoint; falls back to the character estimate on
/// any failure. Always yields a number, never an error.
pub struct TokenCounter {
    upstream: Arc<UpstreamClient>,
    count_url: String,
}

impl TokenCounter {
    pub fn new(upstream: Arc<UpstreamClient>, base_url: &str) -> Self {
        Self {
            upstream,
            count_url: format!(
                "{}/v1/messages/count_tokens",
                base_url.trim_end_matches('/')
            ),
        }
    }

    pub async fn count(
        &self,
        shaped_body: &Value,
        headers: Vec<(String, String)>,
        proxy: Option<String>,
    ) -> u64 {
        let reduced = reduced_body(shaped_body);
        let payload = match serde_json::to_vec(&reduced) {
            Ok(bytes) => bytes,
            Err(_) => return estimate_tokens(shaped_body),
        };
        let request = UpstreamRequest {
            url: self.count_url.clone(),
            headers,
            body: Bytes::from(payload),
            stream: false,
            proxy,
            timeout: Some(COUNT_TIMEOUT),
        };
        match self.upstream.send(request).await {
            Ok(response) if (200..300).contains(&response.status) => {
                match response.into_bytes().await {
                    Some(bytes) => serde_json::from_slice::<Value>(&bytes)
                        .ok()
                        .and_then(|value| {
                            value.get("input_tokens").and_then(Value::as_u64)
                        })
                        .unwrap_or_else(|| estimate_tokens(shaped_body)),
                    None => estimate_tokens(shaped_body),
                }
            }
            Ok(response) => {
                debug!(
                    event = "count_tokens_fallback",
                    status = response.status
                );
                estimate_tokens(shaped_body)
            }
            Err(err) => {
                debug!(event = "count_tokens_fallback", error = %err);
                estimate_tokens(shaped_body)
            }
        }
    }
}
