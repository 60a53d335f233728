use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crelay_accounts::{session_hash, Account, AccountRegistry, AccountSelector, TokenRefresher};
use crelay_common::{RelayConfig, RelayError, RelayResult};
use crelay_protocol::{is_rate_limit_payload, LineBuffer, StreamUsage, UsageWatcher};
use crelay_store::TtlCache;

use crate::auth::{ApiKeyRecord, Persona};
use crate::count_tokens::{TokenCounter, TOKEN_FLOOR};
use crate::events::{SharedUsageSink, UsageEvent};
use crate::shape::{
    compose_upstream_headers, is_genuine_claude_code, snapshot_headers,
    synthesize_response_headers, RequestShaper, ResponseShaper,
};
use crate::upstream::{UpstreamBody, UpstreamClient, UpstreamRequest, UpstreamResponse};

pub enum RelayResponse {
    Json {
        status: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
    },
    Stream {
        status: u16,
        headers: Vec<(String, String)>,
        rx: mpsc::Receiver<Bytes>,
    },
}

/// Glue for one relayed request: policy checks, account choice, token
/// freshness, body shaping, dispatch, response shaping, usage accounting.
pub struct RelayEngine {
    config: Arc<RelayConfig>,
    registry: Arc<AccountRegistry>,
    selector: AccountSelector,
    refresher: Arc<TokenRefresher>,
    upstream: Arc<UpstreamClient>,
    counter: TokenCounter,
    request_shaper: RequestShaper,
    sink: SharedUsageSink,
    dedup: Option<TtlCache<String, ()>>,
    messages_url: String,
}

impl RelayEngine {
    pub fn new(
        config: Arc<RelayConfig>,
        registry: Arc<AccountRegistry>,
        refresher: Arc<TokenRefresher>,
        upstream: Arc<UpstreamClient>,
        sink: SharedUsageSink,
    ) -> Self {
        let selector = AccountSelector::new(registry.clone());
        let counter = TokenCounter::new(upstream.clone(), &config.upstream.url);
        let request_shaper = RequestShaper::new(
            &config.models,
            config.upstream.system_prompt.clone(),
        );
        let dedup = config.performance.dedup.enabled.then(|| {
            TtlCache::new(
                Duration::from_millis(config.performance.dedup.window_ms),
                config.performance.dedup.max,
            )
        });
        let messages_url = format!(
            "{}/v1/messages",
            config.upstream.url.trim_end_matches('/')
        );
        Self {
            config,
            registry,
            selector,
            refresher,
            upstream,
            counter,
            request_shaper,
            sink,
            dedup,
            messages_url,
        }
    }

    pub async fn relay_messages(
        &self,
        key: &ApiKeyRecord,
        request_id: &str,
        downstream_headers: &HeaderMap,
        body_bytes: &Bytes,
    ) -> RelayResult<RelayResponse> {
        let body: Value = serde_json::from_slice(body_bytes)
            .map_err(|err| RelayError::BodyShapeInvalid(err.to_string()))?;
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::BodyShapeInvalid("missing model".into()))?
            .to_string();
        let user_agent = header(downstream_headers, "user-agent");

        key.check_model(&model)?;
        key.check_client(user_agent.as_deref())?;

        if let Some(dedup) = &self.dedup {
            let fingerprint = request_fingerprint(&key.id, body_bytes);
            if dedup.get(&fingerprint).is_some() {
                warn!(event = "duplicate_request", request_id = %request_id, key_id = %key.id);
                return Ok(duplicate_response());
            }
            dedup.insert(fingerprint, ());
        }

        let hash = session_hash(&key.id, &body);
        let (account, access_token) = self
            .select_and_refresh(key.bound_account_id.as_deref(), hash.as_deref())
            .await?;

        let genuine = is_genuine_claude_code(user_agent.as_deref(), &body);
        let shaped = self.request_shaper.shape(&body, user_agent.as_deref());

        if key.persona.enforces_token_floor() {
            let count_headers = self.bare_upstream_headers(&access_token);
            let counted = self
                .counter
                .count(&shaped, count_headers, account.proxy.as_ref().map(|p| p.to_url()))
                .await;
            if counted < TOKEN_FLOOR {
                return Err(RelayError::TokenFloorNotMet {
                    current: counted,
                    minimum: TOKEN_FLOOR,
                });
            }
        }

        let captured = if genuine {
            None
        } else {
            self.registry.headers_get(&account.id).await?
        };
        let upstream_headers = compose_upstream_headers(
            &self.config.upstream.api_version,
            &self.config.upstream.beta_header,
            &access_token,
            downstream_headers,
            captured.as_ref(),
            genuine,
        );

        let stream = shaped.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let payload = serde_json::to_vec(&shaped)
            .map_err(|err| RelayError::BodyShapeInvalid(err.to_string()))?;
        let request = UpstreamRequest {
            url: self.messages_url.clone(),
            headers: upstream_headers,
            body: Bytes::from(payload),
            stream,
            proxy: account.proxy.as_ref().map(|p| p.to_url()),
            timeout: Some(Duration::from_millis(self.config.proxy.timeout_ms)),
        };

        let response = self.dispatch_with_retry(request).await?;
        info!(
            event = "upstream_responded",
            request_id = %request_id,
            account_id = %account.id,
            model = %model,
            status = response.status,
            is_stream = stream,
        );

        let event = UsageEvent {
            request_id: request_id.to_string(),
            api_key_id: key.id.clone(),
            account_id: account.id.clone(),
            persona: key.persona.as_str(),
            model: Some(model),
            stream,
            ..Default::default()
        };

        if stream && (200..300).contains(&response.status) {
            self.on_success(&account, genuine, downstream_headers).await;
            return Ok(self.relay_stream(key.persona, account, hash, response, event));
        }
        self.finish_buffered(key.persona, &account, genuine, hash, downstream_headers, response, event, stream)
            .await
    }

    /// Authenticated passthrough of the upstream count endpoint.
    pub async fn relay_count_tokens(
        &self,
        key: &ApiKeyRecord,
        downstream_headers: &HeaderMap,
        body_bytes: &Bytes,
    ) -> RelayResult<RelayResponse> {
        let body: Value = serde_json::from_slice(body_bytes)
            .map_err(|err| RelayError::BodyShapeInvalid(err.to_string()))?;
        if let Some(model) = body.get("model").and_then(Value::as_str) {
            key.check_model(model)?;
        }
        let user_agent = header(downstream_headers, "user-agent");
        key.check_client(user_agent.as_deref())?;

        let hash = session_hash(&key.id, &body);
        let (account, access_token) = self
            .select_and_refresh(key.bound_account_id.as_deref(), hash.as_deref())
            .await?;
        let shaped = self.request_shaper.shape(&body, user_agent.as_deref());
        let counted = self
            .counter
            .count(
                &shaped,
                self.bare_upstream_headers(&access_token),
                account.proxy.as_ref().map(|p| p.to_url()),
            )
            .await;
        Ok(RelayResponse::Json {
            status: 200,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(json!({"input_tokens": counted}).to_string()),
        })
    }

    /// Selection and refresh touch the KV store; transient store failures
    /// get the same backoff schedule as upstream transport failures.
    async fn select_and_refresh(
        &self,
        bound_account_id: Option<&str>,
        hash: Option<&str>,
    ) -> RelayResult<(Account, String)> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = async {
                let account = self.selector.select(bound_account_id, hash).await?;
                let token = self.refresher.get_valid_access_token(&account.id).await?;
                Ok::<_, RelayError>((account, token))
            }
            .await;
            match result {
                Ok(pair) => return Ok(pair),
                Err(err) if err.is_retriable() => match RelayError::backoff_delay(attempt) {
                    Some(delay) => {
                        warn!(
                            event = "selection_retry",
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
    }

    async fn dispatch_with_retry(
        &self,
        request: UpstreamRequest,
    ) -> RelayResult<UpstreamResponse> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.upstream.send(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retriable() => {
                    match RelayError::backoff_delay(attempt) {
                        Some(delay) => {
                            warn!(
                                event = "upstream_retry",
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %err
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_buffered(
        &self,
        persona: Persona,
        account: &Account,
        genuine: bool,
        hash: Option<String>,
        downstream_headers: &HeaderMap,
        response: UpstreamResponse,
        mut event: UsageEvent,
        stream: bool,
    ) -> RelayResult<RelayResponse> {
        let status = response.status;
        let upstream_headers = response.headers.clone();
        let body = response.into_bytes().await.unwrap_or_default();
        let body_text = String::from_utf8_lossy(&body).into_owned();

        if !(200..300).contains(&status) {
            if status == 429 || is_rate_limit_payload(&body_text) {
                self.registry
                    .mark_rate_limited(&account.id, hash.as_deref())
                    .await?;
            }
            if stream {
                // The client asked for SSE; wrap the error head in an
                // error event so its parser sees a well-formed stream.
                let envelope = sse_error_envelope(&body_text);
                return Ok(RelayResponse::Json {
                    status,
                    headers: vec![(
                        "content-type".to_string(),
                        "text/event-stream".to_string(),
                    )],
                    body: envelope,
                });
            }
            return Ok(RelayResponse::Json {
                status,
                headers: passthrough_headers(upstream_headers),
                body,
            });
        }

        self.on_success(account, genuine, downstream_headers).await;

        let usage = parse_usage(&body_text);
        event.input_tokens = usage.input_tokens;
        event.output_tokens = usage.output_tokens;
        event.cache_creation_input_tokens = usage.cache_creation_input_tokens;
        event.cache_read_input_tokens = usage.cache_read_input_tokens;
        self.sink.record(event);

        let shaper = ResponseShaper::new(persona, self.config.upstream.apply_input_offset);
        let shaped_body = shaper.shape_body(&body_text);
        let headers = match persona {
            Persona::Cc => passthrough_headers(upstream_headers),
            _ => synthesize_response_headers(
                persona,
                &self.config.personas.databricks_org_id,
                usage.input_tokens.zip(usage.output_tokens),
                "application/json",
            ),
        };
        Ok(RelayResponse::Json {
            status,
            headers,
            body: Bytes::from(shaped_body),
        })
    }

    fn relay_stream(
        &self,
        persona: Persona,
        account: Account,
        hash: Option<String>,
        response: UpstreamResponse,
        event: UsageEvent,
    ) -> RelayResponse {
        let status = response.status;
        let headers = match persona {
            Persona::Cc => {
                let mut headers = passthrough_headers(response.headers);
                if !headers
                    .iter()
                    .any(|(n, _)| n.eq_ignore_ascii_case("content-type"))
                {
                    headers.push((
                        "content-type".to_string(),
                        "text/event-stream".to_string(),
                    ));
                }
                headers
            }
            _ => synthesize_response_headers(
                persona,
                &self.config.personas.databricks_org_id,
                None,
                "text/event-stream",
            ),
        };

        let mut upstream_rx = match response.body {
            UpstreamBody::Stream(rx) => rx,
            UpstreamBody::Bytes(bytes) => {
                let (tx, rx) = mpsc::channel(1);
                let _ = tx.try_send(bytes);
                rx
            }
        };

        let shaper = ResponseShaper::new(persona, self.config.upstream.apply_input_offset);
        let registry = self.registry.clone();
        let sink = self.sink.clone();
        let (tx, rx) = mpsc::channel::<Bytes>(16);
        tokio::spawn(async move {
            let mut lines = LineBuffer::new();
            let mut watcher = UsageWatcher::new();
            let mut event = Some(event);
            while let Some(chunk) = upstream_rx.recv().await {
                for line in lines.push(&chunk) {
                    if let Some(usage) = watcher.observe_line(&line) {
                        emit_stream_usage(&sink, &mut event, usage);
                    }
                    let shaped = shaper.shape_sse_line(&line);
                    if !forward_line(&tx, shaped).await {
                        return;
                    }
                }
            }
            if let Some(tail) = lines.finish() {
                if let Some(usage) = watcher.observe_line(&tail) {
                    emit_stream_usage(&sink, &mut event, usage);
                }
                let shaped = shaper.shape_sse_line(&tail);
                let _ = forward_line(&tx, shaped).await;
            }
            if event.is_some() {
                // Stream ended before both counts arrived; account for what
                // was seen so every 2xx yields exactly one event.
                let partial = watcher.partial().clone();
                emit_stream_usage(&sink, &mut event, partial);
            }
            if watcher.rate_limit_detected() {
                let _ = registry
                    .mark_rate_limited(&account.id, hash.as_deref())
                    .await;
            }
        });

        RelayResponse::Stream {
            status,
            headers,
            rx,
        }
    }

    async fn on_success(&self, account: &Account, genuine: bool, downstream: &HeaderMap) {
        if let Err(err) = self.registry.clear_rate_limit(&account.id).await {
            warn!(event = "clear_rate_limit_failed", account_id = %account.id, error = %err);
        }
        if genuine {
            let snapshot = snapshot_headers(downstream);
            if let Err(err) = self.registry.headers_put(&account.id, &snapshot).await {
                warn!(event = "header_capture_failed", account_id = %account.id, error = %err);
            }
        }
    }

    fn bare_upstream_headers(&self, access_token: &str) -> Vec<(String, String)> {
        vec![
            ("content-type".to_string(), "application/json".to_string()),
            (
                "authorization".to_string(),
                format!("Bearer {access_token}"),
            ),
            (
                "anthropic-version".to_string(),
                self.config.upstream.api_version.clone(),
            ),
            (
                "anthropic-beta".to_string(),
                self.config.upstream.beta_header.clone(),
            ),
            (
                "user-agent".to_string(),
                crate::shape::DEFAULT_CLIENT_UA.to_string(),
            ),
        ]
    }
}

async fn forward_line(tx: &mpsc::Sender<Bytes>, line: String) -> bool {
    let mut bytes = line.into_bytes();
    bytes.push(b'\n');
    tx.send(Bytes::from(bytes)).await.is_ok()
}

fn emit_stream_usage(
    sink: &SharedUsageSink,
    event: &mut Option<UsageEvent>,
    usage: StreamUsage,
) {
    if let Some(mut event) = event.take() {
        event.input_tokens = usage.input_tokens;
        event.output_tokens = usage.output_tokens;
        event.cache_creation_input_tokens = usage.cache_creation_input_tokens;
        event.cache_read_input_tokens = usage.cache_read_input_tokens;
        if event.model.is_none() {
            event.model = usage.model;
        }
        sink.record(event);
    }
}

fn parse_usage(body: &str) -> StreamUsage {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return StreamUsage::default();
    };
    let Some(usage) = value.get("usage") else {
        return StreamUsage::default();
    };
    StreamUsage {
        input_tokens: usage.get("input_tokens").and_then(Value::as_i64),
        output_tokens: usage.get("output_tokens").and_then(Value::as_i64),
        cache_creation_input_tokens: usage
            .get("cache_creation_input_tokens")
            .and_then(Value::as_i64),
        cache_read_input_tokens: usage
            .get("cache_read_input_tokens")
            .and_then(Value::as_i64),
        model: value
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Upstream bodies arrive already decoded, so the framing headers no longer
/// describe them.
fn passthrough_headers(headers: Vec<(String, String)>) -> Vec<(String, String)> {
    headers
        .into_iter()
        .filter(|(name, _)| {
            !name.eq_ignore_ascii_case("content-length")
                && !name.eq_ignore_ascii_case("content-encoding")
                && !name.eq_ignore_ascii_case("transfer-encoding")
                && !name.eq_ignore_ascii_case("connection")
        })
        .collect()
}

fn sse_error_envelope(body: &str) -> Bytes {
    let data = match serde_json::from_str::<Value>(body) {
        Ok(value) => value,
        Err(_) => json!({"type": "error", "error": {"type": "upstream_error", "message": body}}),
    };
    Bytes::from(format!("event: error\ndata: {data}\n\n"))
}

fn request_fingerprint(key_id: &str, body: &Bytes) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(body);
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn duplicate_response() -> RelayResponse {
    RelayResponse::Json {
        status: 429,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: Bytes::from(
            json!({
                "error": {
                    "type": "rate_limit_error",
                    "message": "Duplicate request detected, please retry later",
                }
            })
            .to_string(),
        ),
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}
