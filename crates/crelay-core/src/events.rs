use std::sync::Arc;

/// Token-accounting event handed to the external usage sink. Exactly one is
/// emitted per successful request.
#[derive(Debug, Clone, Default)]
pub struct UsageEvent {
    pub request_id: String,
    pub api_key_id: String,
    pub account_id: String,
    pub persona: &'static str,
    pub model: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cache_creation_input_tokens: Option<i64>,
    pub cache_read_input_tokens: Option<i64>,
    pub stream: bool,
}

pub trait UsageSink: Send + Sync {
    fn record(&self, event: UsageEvent);
}

#[derive(Debug, Default)]
pub struct NoopUsageSink;

impl UsageSink for NoopUsageSink {
    fn record(&self, _event: UsageEvent) {}
}

pub type SharedUsageSink = Arc<dyn UsageSink>;
