use bytes::Bytes;
use serde_json::{json, Value};

use crelay_core::shape::{
    compose_upstream_headers, is_genuine_claude_code, RequestShaper, ResponseShaper,
    CLAUDE_CODE_PRELUDE,
};
use crelay_core::Persona;
use crelay_protocol::{LineBuffer, UsageWatcher};
use http::{HeaderMap, HeaderValue};

const CLI_UA: &str = "claude-cli/1.0.57 (external, cli)";

fn cli_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("user-agent", HeaderValue::from_static(CLI_UA));
    headers.insert("authorization", HeaderValue::from_static("Bearer key"));
    headers.insert("x-app", HeaderValue::from_static("cli"));
    headers
}

#[test]
fn genuine_claude_code_request_passes_through() {
    let body = json!({
        "model": "claude-sonnet-4-20250514",
        "system": [{"type": "text",
            "text": "You are Claude Code, Anthropic's official CLI for Claude."}],
        "messages": [{"role": "user", "content": "ping"}],
    });
    assert!(is_genuine_claude_code(Some(CLI_UA), &body));

    let shaped = RequestShaper::new(&[], None).shape(&body, Some(CLI_UA));
    assert_eq!(shaped["system"], body["system"]);

    // Response side for persona cc: only the input offset changes.
    let response = r#"{"id":"msg_01","usage":{"input_tokens":100,"output_tokens":9}}"#;
    let shaped = ResponseShaper::new(Persona::Cc, true).shape_body(response);
    let value: Value = serde_json::from_str(&shaped).unwrap();
    assert_eq!(value["usage"]["input_tokens"], 86);
    assert_eq!(value["id"], "msg_01");
}

#[test]
fn non_genuine_client_is_normalized_and_overlaid() {
    let body = json!({
        "model": "claude-sonnet-4-20250514",
        "messages": [{"role": "user", "content": "hi"}],
    });
    assert!(!is_genuine_claude_code(Some("curl/8"), &body));

    let shaped = RequestShaper::new(&[], None).shape(&body, Some("curl/8"));
    assert_eq!(shaped["system"][0]["text"], CLAUDE_CODE_PRELUDE);

    // Headers captured from an earlier genuine client are replayed for
    // fields the non-genuine client did not send.
    let mut captured = std::collections::HashMap::new();
    captured.insert("x-stainless-runtime".to_string(), "node".to_string());
    let mut downstream = HeaderMap::new();
    downstream.insert("user-agent", HeaderValue::from_static("curl/8"));
    let composed = compose_upstream_headers(
        "2023-06-01",
        "beta",
        "tok",
        &downstream,
        Some(&captured),
        false,
    );
    assert!(composed
        .iter()
        .any(|(n, v)| n == "x-stainless-runtime" && v == "node"));
    assert!(composed.iter().any(|(n, v)| n == "user-agent" && v == "curl/8"));
}

#[test]
fn genuine_snapshot_source_headers_compose_without_overlay() {
    let composed =
        compose_upstream_headers("2023-06-01", "beta", "tok", &cli_headers(), None, true);
    assert!(composed.iter().any(|(n, v)| n == "x-app" && v == "cli"));
    assert!(composed
        .iter()
        .any(|(n, v)| n == "authorization" && v == "Bearer tok"));
}

#[test]
fn databricks_rewrite_matches_the_bedrock_contract() {
    let upstream = json!({
        "id": "msg_01ABC",
        "content": [{"type": "tool_use", "id": "toolu_42", "name": "get", "input": {}}],
        "usage": {
            "input_tokens": 1000,
            "cache_read_input_tokens": 200,
            "cache_creation_input_tokens": 50,
            "output_tokens": 30,
        },
    });
    let shaped = ResponseShaper::new(Persona::Databricks, true)
        .shape_body(&upstream.to_string());
    let value: Value = serde_json::from_str(&shaped).unwrap();
    assert_eq!(value["id"], "msg_bdrk_01ABC");
    assert_eq!(value["content"][0]["id"], "toolu_bdrk_42");
    assert_eq!(value["usage"]["input_tokens"], 1236);
    assert_eq!(value["usage"]["cache_read_input_tokens"], 0);
    assert_eq!(value["usage"]["cache_creation_input_tokens"], 0);
    assert_eq!(value["usage"]["output_tokens"], 30);
}

#[test]
fn sse_relay_preserves_line_integrity() {
    let upstream_text = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_01\",\"usage\":{\"input_tokens\":100}}}\n",
        "\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hey\"}}\n",
        "\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":7}}\n",
        "\n",
        "data: [DONE]\n",
    );

    // Chunk at awkward boundaries.
    let bytes = upstream_text.as_bytes();
    let chunks: Vec<&[u8]> = bytes.chunks(13).collect();

    let shaper = ResponseShaper::new(Persona::Cc, true);
    let mut lines = LineBuffer::new();
    let mut watcher = UsageWatcher::new();
    let mut forwarded = String::new();
    let mut emissions = 0;
    for chunk in chunks {
        for line in lines.push(chunk) {
            if watcher.observe_line(&line).is_some() {
                emissions += 1;
            }
            forwarded.push_str(&shaper.shape_sse_line(&line));
            forwarded.push('\n');
        }
    }
    assert!(lines.finish().is_none());

    // Exactly one usage emission from the stream (invariant), and every
    // non-data line plus [DONE] is forwarded verbatim.
    assert_eq!(emissions, 1);
    for line in upstream_text.lines() {
        if !line.starts_with("data: {") {
            assert!(forwarded.contains(&format!("{line}\n")), "missing {line:?}");
        }
    }
    // Rewritten data lines stay semantically identical for persona cc
    // except for the input offset.
    assert!(forwarded.contains("\"output_tokens\":7"));
    assert!(forwarded.contains("\"input_tokens\":86"));
}

#[test]
fn aws_stream_rewrites_nested_message_ids() {
    let shaper = ResponseShaper::new(Persona::Aws, true);
    let line = r#"data: {"type":"message_start","message":{"id":"msg_01X","content":[],"usage":{"input_tokens":50,"output_tokens":0}}}"#;
    let shaped = shaper.shape_sse_line(line);
    let value: Value =
        serde_json::from_str(shaped.strip_prefix("data: ").unwrap()).unwrap();
    assert_eq!(value["message"]["id"], "msg_bdrk_01X");
    assert_eq!(value["message"]["usage"]["input_tokens"], 36);
}

#[test]
fn relay_line_framing_appends_exactly_one_newline() {
    // The engine forwards each whole line with a single trailing \n so the
    // downstream byte stream reproduces the upstream framing.
    let mut lines = LineBuffer::new();
    let out = lines.push(b"data: {\"a\":1}\n\ndata: [DONE]\n");
    let rebuilt: Vec<u8> = out
        .iter()
        .flat_map(|line| {
            let mut bytes = line.clone().into_bytes();
            bytes.push(b'\n');
            bytes
        })
        .collect();
    assert_eq!(
        Bytes::from(rebuilt),
        Bytes::from_static(b"data: {\"a\":1}\n\ndata: [DONE]\n")
    );
}
