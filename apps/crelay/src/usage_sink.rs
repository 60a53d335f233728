use tracing::info;

use crelay_core::{UsageEvent, UsageSink};

/// Emits each usage event as a structured log record; a billing pipeline
/// tails these downstream.
#[derive(Debug, Default)]
pub(crate) struct TracingUsageSink;

impl UsageSink for TracingUsageSink {
    fn record(&self, event: UsageEvent) {
        info!(
            event = "usage",
            request_id = %event.request_id,
            key_id = %event.api_key_id,
            account_id = %event.account_id,
            persona = event.persona,
            model = event.model.as_deref().unwrap_or("unknown"),
            input_tokens = event.input_tokens.unwrap_or(0),
            output_tokens = event.output_tokens.unwrap_or(0),
            cache_creation_input_tokens = event.cache_creation_input_tokens.unwrap_or(0),
            cache_read_input_tokens = event.cache_read_input_tokens.unwrap_or(0),
            is_stream = event.stream,
        );
    }
}
