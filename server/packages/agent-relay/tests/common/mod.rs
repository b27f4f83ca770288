#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

use agent_relay::backend::MockBackend;
use agent_relay::driver::InvocationDriver;
use agent_relay::resolver::{ProviderCredential, ProviderType, StaticModelResolver};
use agent_relay::router::{build_router, AppState};
use agent_relay::sse::{BridgeConfig, DEFAULT_KEEP_ALIVE, DEFAULT_STREAM_TIMEOUT};

pub const SESSION_ID: &str = "session-123";
pub const MODEL_ID: &str = "anthropic:claude-sonnet-4-5";

pub struct TestApp {
    pub app: Router,
    pub backend: MockBackend,
    workdir: TempDir,
}

impl TestApp {
    pub fn new(backend: MockBackend) -> Self {
        Self::with_timeout(backend, DEFAULT_STREAM_TIMEOUT)
    }

    pub fn with_timeout(backend: MockBackend, timeout: Duration) -> Self {
        let workdir = tempfile::tempdir().expect("create temp workdir");
        let resolver = StaticModelResolver::new().with_provider(
            "anthropic",
            ProviderType::Anthropic,
            ProviderCredential::new("sk-test"),
        );
        let driver = InvocationDriver::new(Arc::new(backend.clone()), Arc::new(resolver));
        let state = AppState::new(driver).with_bridge_config(BridgeConfig {
            timeout,
            keep_alive: DEFAULT_KEEP_ALIVE,
        });
        Self {
            app: build_router(state),
            backend,
            workdir,
        }
    }

    pub fn workdir(&self) -> String {
        self.workdir.path().display().to_string()
    }

    pub fn prompt_body(&self, prompt: &str) -> Value {
        json!({
            "prompt": prompt,
            "workingDirectory": self.workdir(),
            "modelId": MODEL_ID,
            "configuration": {"permissionMode": "acceptEdits"}
        })
    }
}

pub async fn send_raw(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<String>,
) -> (StatusCode, HeaderMap, String) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = match body {
        Some(body) => {
            builder = builder.header("content-type", "application/json");
            Body::from(body)
        }
        None => Body::empty(),
    };
    let request = builder.body(body).expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    (status, headers, String::from_utf8_lossy(&bytes).to_string())
}

pub async fn send_prompt(
    app: &Router,
    session_id: &str,
    query: &str,
    body: &Value,
) -> (StatusCode, HeaderMap, String) {
    let path = format!("/v1/sessions/{session_id}/prompt{query}");
    send_raw(app, Method::POST, &path, Some(body.to_string())).await
}

/// `data:` payloads of an SSE body, in order. Keep-alive comments are
/// dropped.
pub fn sse_data(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter(|frame| !frame.trim().is_empty())
        .filter_map(|frame| {
            let data: Vec<&str> = frame
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|data| data.strip_prefix(' ').unwrap_or(data))
                .collect();
            if data.is_empty() {
                None
            } else {
                Some(data.join("\n"))
            }
        })
        .collect()
}

/// Splits SSE payloads into chunk JSON and asserts the stream ends with a
/// single `[DONE]`.
pub fn chunks_until_done(body: &str) -> Vec<Value> {
    let data = sse_data(body);
    assert_eq!(
        data.iter().filter(|data| data.as_str() == "[DONE]").count(),
        1,
        "exactly one [DONE] in {body:?}"
    );
    assert_eq!(data.last().map(String::as_str), Some("[DONE]"), "[DONE] last");
    data[..data.len() - 1]
        .iter()
        .map(|data| serde_json::from_str(data).expect("chunk json"))
        .collect()
}

pub fn chunk_types(chunks: &[Value]) -> Vec<String> {
    chunks
        .iter()
        .map(|chunk| chunk["type"].as_str().unwrap_or_default().to_string())
        .collect()
}

pub fn stream_event(event: Value) -> Value {
    json!({"type": "stream_event", "session_id": "native-1", "event": event})
}

pub fn scenario_a() -> Vec<Value> {
    vec![
        stream_event(json!({"type": "message_start", "message": {"id": "msg_a"}})),
        stream_event(json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": {"type": "tool_use", "id": "tool-1", "name": "Bash", "input": {}}
        })),
        stream_event(json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "input_json_delta", "partial_json": "{\"command\":\"ls\"}"}
        })),
        json!({
            "type": "assistant",
            "session_id": "native-1",
            "message": {
                "id": "msg_a",
                "content": [{"type": "tool_use", "id": "tool-1", "name": "Bash", "input": {"command": "ls"}}]
            }
        }),
        stream_event(json!({"type": "content_block_stop", "index": 0})),
        stream_event(json!({
            "type": "message_delta",
            "delta": {"stop_reason": "tool_use"},
            "usage": {"input_tokens": 1, "output_tokens": 5}
        })),
        stream_event(json!({"type": "message_stop"})),
        json!({
            "type": "user",
            "session_id": "native-1",
            "message": {"content": [{"type": "tool_result", "tool_use_id": "tool-1", "content": "ok"}]}
        }),
    ]
}

pub fn scenario_b() -> Vec<Value> {
    vec![
        stream_event(json!({"type": "message_start", "message": {"id": "msg_b"}})),
        stream_event(json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": {"type": "text", "text": ""}
        })),
        stream_event(json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": "Hello"}
        })),
        stream_event(json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": " world"}
        })),
        stream_event(json!({"type": "content_block_stop", "index": 0})),
        stream_event(json!({
            "type": "message_delta",
            "delta": {"stop_reason": "end_turn"},
            "usage": {"input_tokens": 2, "output_tokens": 4}
        })),
        stream_event(json!({"type": "message_stop"})),
    ]
}
