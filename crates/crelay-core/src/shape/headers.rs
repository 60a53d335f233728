use std::collections::HashMap;

use http::HeaderMap;
use rand::distr::Alphanumeric;
use rand::Rng;
use time::format_description::well_known::Rfc3339;
use time::{Duration as TimeDuration, OffsetDateTime};
use uuid::Uuid;

use crate::auth::Persona;

/// Never forwarded upstream and never captured for replay.
pub const SENSITIVE_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "authorization",
    "x-api-key",
    "proxy-authorization",
    "content-encoding",
    "transfer-encoding",
];

pub const DEFAULT_CLIENT_UA: &str = "claude-cli/1.0.57 (external, cli)";

fn is_sensitive(name: &str) -> bool {
    SENSITIVE_HEADERS
        .iter()
        .any(|header| header.eq_ignore_ascii_case(name))
}

/// Downstream headers eligible to travel upstream; `x-request-id` is always
/// kept for correlation.
pub fn filter_downstream_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (name, value) in headers {
        let name = name.as_str();
        if is_sensitive(name) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.push((name.to_string(), value.to_string()));
        }
    }
    out
}

/// Snapshot of a genuine Claude-Code client's headers, stored per account
/// and replayed for later non-genuine callers.
pub fn snapshot_headers(headers: &HeaderMap) -> HashMap<String, String> {
    filter_downstream_headers(headers).into_iter().collect()
}

/// Full upstream header set for a chat or count-tokens call.
pub fn compose_upstream_headers(
    api_version: &str,
    beta_header: &str,
    access_token: &str,
    downstream: &HeaderMap,
    captured: Option<&HashMap<String, String>>,
    genuine: bool,
) -> Vec<(String, String)> {
    let mut headers = filter_downstream_headers(downstream);

    // A non-genuine client gets the last captured Claude-Code fingerprint
    // for any field it did not supply itself.
    if !genuine {
        if let Some(captured) = captured {
            for (name, value) in captured {
                if !has_header(&headers, name) {
                    headers.push((name.clone(), value.clone()));
                }
            }
        }
    }

    set_header(&mut headers, "content-type", "application/json");
    set_header(&mut headers, "authorization", &format!("Bearer {access_token}"));
    set_header(&mut headers, "anthropic-version", api_version);
    if !has_header(&headers, "anthropic-beta") && !beta_header.is_empty() {
        headers.push(("anthropic-beta".to_string(), beta_header.to_string()));
    }
    if !has_header(&headers, "user-agent") {
        headers.push(("user-agent".to_string(), DEFAULT_CLIENT_UA.to_string()));
    }
    headers
}

fn has_header(headers: &[(String, String)], name: &str) -> bool {
    headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
}

fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    headers.push((name.to_string(), value.to_string()));
}

/// Downstream response headers fabricated per persona. `cc` passes the
/// upstream headers through and never calls this.
pub fn synthesize_response_headers(
    persona: Persona,
    databricks_org_id: &str,
    usage: Option<(i64, i64)>,
    content_type: &str,
) -> Vec<(String, String)> {
    let mut rng = rand::rng();
    let mut headers = vec![("content-type".to_string(), content_type.to_string())];
    match persona {
        Persona::Cc => headers,
        Persona::Anthropic => {
            let reset = (OffsetDateTime::now_utc() + TimeDuration::seconds(60))
                .format(&Rfc3339)
                .unwrap_or_default();
            let request_id: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(24)
                .map(char::from)
                .collect();
            let ray: String = (0..16)
                .map(|_| char::from_digit(rng.random_range(0..16), 16).unwrap_or('0'))
                .collect();
            headers.extend([
                (
                    "anthropic-ratelimit-requests-limit".to_string(),
                    "4000".to_string(),
                ),
                (
                    "anthropic-ratelimit-requests-remaining".to_string(),
                    rng.random_range(3600..4000).to_string(),
                ),
                ("anthropic-ratelimit-requests-reset".to_string(), reset.clone()),
                (
                    "anthropic-ratelimit-tokens-limit".to_string(),
                    "400000".to_string(),
                ),
                (
                    "anthropic-ratelimit-tokens-remaining".to_string(),
                    rng.random_range(300_000..400_000).to_string(),
                ),
                ("anthropic-ratelimit-tokens-reset".to_string(), reset),
                ("request-id".to_string(), format!("req_{request_id}")),
                (
                    "anthropic-organization-id".to_string(),
                    Uuid::new_v4().to_string(),
                ),
                ("cf-ray".to_string(), format!("{ray}-SJC")),
                ("server".to_string(), "cloudflare".to_string()),
            ]);
            headers
        }
        Persona::Aws | Persona::Databricks => {
            let (input, output) = usage.unwrap_or_else(|| {
                (
                    rng.random_range(200..4000),
                    rng.random_range(50..1500),
                )
            });
            headers.extend([
                ("x-amzn-requestid".to_string(), Uuid::new_v4().to_string()),
                (
                    "x-amzn-bedrock-invocation-latency".to_string(),
                    rng.random_range(1000..=3000).to_string(),
                ),
                (
                    "x-amzn-bedrock-input-token-count".to_string(),
                    input.to_string(),
                ),
                (
                    "x-amzn-bedrock-output-token-count".to_string(),
                    output.to_string(),
                ),
            ]);
            if persona == Persona::Databricks {
                headers.extend([
                    (
                        "x-databricks-org-id".to_string(),
                        databricks_org_id.to_string(),
                    ),
                    ("server".to_string(), "databricks".to_string()),
                    (
                        "strict-transport-security".to_string(),
                        "max-age=31536000; includeSubDomains; preload".to_string(),
                    ),
                ]);
            }
            headers
        }
    }
}
