use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crelay_common::RelayError;

use crate::auth::KeyValidator;
use crate::engine::{RelayEngine, RelayResponse};

pub struct AppState {
    pub engine: Arc<RelayEngine>,
    pub validator: Arc<KeyValidator>,
    pub started_at: Instant,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(messages))
        .route("/v1/messages/count_tokens", post(count_tokens))
        .route("/v1/key-info", get(key_info))
        .route("/health", get(health))
        .with_state(state)
}

async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = request_id(&headers);
    let started_at = Instant::now();

    let key = match state.validator.validate(&headers).await {
        Ok(key) => key,
        Err(err) => return error_response(&err, &request_id, started_at),
    };
    info!(
        event = "downstream_received",
        request_id = %request_id,
        key_id = %key.id,
        persona = key.persona.as_str(),
    );

    match state
        .engine
        .relay_messages(&key, &request_id, &headers, &body)
        .await
    {
        Ok(response) => relay_response(response, &request_id),
        Err(err) => error_response(&err, &request_id, started_at),
    }
}

async fn count_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = request_id(&headers);
    let started_at = Instant::now();
    let key = match state.validator.validate(&headers).await {
        Ok(key) => key,
        Err(err) => return error_response(&err, &request_id, started_at),
    };
    match state.engine.relay_count_tokens(&key, &headers, &body).await {
        Ok(response) => relay_response(response, &request_id),
        Err(err) => error_response(&err, &request_id, started_at),
    }
}

async fn key_info(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let request_id = request_id(&headers);
    let started_at = Instant::now();
    match state.validator.validate(&headers).await {
        Ok(key) => {
            let mut info = json!({
                "persona": key.persona.as_str(),
                "name": key.name,
            });
            if key.enable_model_restriction {
                let mut models: Vec<&String> = key.restricted_models.iter().collect();
                models.sort();
                info["restricted_models"] = json!(models);
            }
            json_response(StatusCode::OK, info.to_string())
        }
        Err(err) => error_response(&err, &request_id, started_at),
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let body = json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    });
    json_response(StatusCode::OK, body.to_string())
}

fn relay_response(response: RelayResponse, request_id: &str) -> Response {
    match response {
        RelayResponse::Json {
            status,
            headers,
            body,
        } => {
            let mut resp = Response::new(Body::from(body));
            *resp.status_mut() =
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            apply_headers(&mut resp, headers);
            set_request_id(&mut resp, request_id);
            resp
        }
        RelayResponse::Stream {
            status,
            headers,
            rx,
        } => {
            let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
            let mut resp = Response::new(Body::from_stream(stream));
            *resp.status_mut() =
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            apply_headers(&mut resp, headers);
            if !resp.headers().contains_key("content-type") {
                resp.headers_mut().insert(
                    "content-type",
                    HeaderValue::from_static("text/event-stream"),
                );
            }
            resp.headers_mut()
                .insert("cache-control", HeaderValue::from_static("no-cache"));
            set_request_id(&mut resp, request_id);
            resp
        }
    }
}

fn error_response(err: &RelayError, request_id: &str, started_at: Instant) -> Response {
    let (status, body, extra): (StatusCode, String, Vec<(&str, String)>) = match err {
        RelayError::KeyNotFound => (
            StatusCode::UNAUTHORIZED,
            json!({"error": {"type": "authentication_error", "message": "invalid api key"}})
                .to_string(),
            vec![],
        ),
        RelayError::KeyForbiddenModel(model) => (
            StatusCode::FORBIDDEN,
            json!({"error": {"type": "forbidden",
                "message": format!("Model {model} is not allowed for this API key")}})
            .to_string(),
            vec![],
        ),
        RelayError::KeyForbiddenClient => (
            StatusCode::FORBIDDEN,
            json!({"error": {"type": "forbidden",
                "message": "Client is not allowed for this API key"}})
            .to_string(),
            vec![],
        ),
        RelayError::TokenFloorNotMet { current, minimum } => (
            StatusCode::TOO_MANY_REQUESTS,
            json!({
                "error": "Too Few Tokens",
                "message": format!(
                    "Input of {current} tokens is below the minimum of {minimum}"),
                "type": "token_limit_error",
                "current_tokens": current,
                "minimum_tokens": minimum,
                "retry_after": 60,
            })
            .to_string(),
            vec![
                ("retry-after", "60".to_string()),
                ("x-error-type", "token_limit_error".to_string()),
            ],
        ),
        RelayError::TokenRefreshFailed { .. } => (
            StatusCode::BAD_GATEWAY,
            json!({"error": {"type": "upstream_auth_error",
                "message": "upstream account authorization failed"}})
            .to_string(),
            vec![],
        ),
        RelayError::BodyShapeInvalid(message) => (
            StatusCode::BAD_REQUEST,
            json!({"error": {"type": "invalid_request_error", "message": message}})
                .to_string(),
            vec![],
        ),
        RelayError::Cancelled => {
            // Client went away; nobody reads this.
            let mut resp = Response::new(Body::empty());
            *resp.status_mut() = StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST);
            return resp;
        }
        other => {
            warn!(
                event = "relay_error",
                request_id = %request_id,
                error_kind = other.kind(),
                status = 500,
                duration_ms = started_at.elapsed().as_millis() as u64,
                error = %other,
            );
            let timestamp = OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default();
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "error": other.to_string(),
                    "requestId": request_id,
                    "timestamp": timestamp,
                })
                .to_string(),
                vec![],
            )
        }
    };

    let mut resp = json_response(status, body);
    for (name, value) in extra {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            resp.headers_mut().insert(name, value);
        }
    }
    set_request_id(&mut resp, request_id);
    resp
}

fn json_response(status: StatusCode, body: String) -> Response {
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        "content-type",
        HeaderValue::from_static("application/json"),
    );
    resp
}

fn apply_headers(resp: &mut Response, headers: Vec<(String, String)>) {
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            resp.headers_mut().insert(name, value);
        }
    }
}

fn set_request_id(resp: &mut Response, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        resp.headers_mut().insert("x-crelay-request-id", value);
    }
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_floor_rejection_carries_the_contract_headers() {
        let err = RelayError::TokenFloorNotMet {
            current: 120,
            minimum: 250,
        };
        let resp = error_response(&err, "rid", Instant::now());
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("retry-after").unwrap(), "60");
        assert_eq!(
            resp.headers().get("x-error-type").unwrap(),
            "token_limit_error"
        );
    }

    #[test]
    fn forbidden_model_is_a_403_with_forbidden_type() {
        let err = RelayError::KeyForbiddenModel("claude-opus-4-20250514".into());
        let resp = error_response(&err, "rid", Instant::now());
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn refresh_failure_maps_to_bad_gateway() {
        let err = RelayError::TokenRefreshFailed {
            account_id: "a".into(),
            message: "nope".into(),
        };
        let resp = error_response(&err, "rid", Instant::now());
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn unexpected_errors_become_500_with_request_id() {
        let err = RelayError::KvUnavailable("down".into());
        let resp = error_response(&err, "rid-7", Instant::now());
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            resp.headers().get("x-crelay-request-id").unwrap(),
            "rid-7"
        );
    }
}
