mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use serde_json::{json, Value};
use tower::util::ServiceExt;

use agent_relay::backend::{MockBackend, MockStep};
use common::{
    chunk_types, chunks_until_done, scenario_a, scenario_b, send_prompt, send_raw, sse_data,
    TestApp, SESSION_ID,
};

#[tokio::test]
async fn health_reports_ok() {
    let test_app = TestApp::new(MockBackend::default());
    let (status, _, body) = send_raw(&test_app.app, Method::GET, "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&body).expect("health json");
    assert_eq!(body, json!({"ok": true}));
}

#[tokio::test]
async fn tool_call_turn_streams_canonical_chunks() {
    let test_app = TestApp::new(MockBackend::from_messages(scenario_a()));
    let (status, headers, body) = send_prompt(
        &test_app.app,
        SESSION_ID,
        "",
        &test_app.prompt_body("list the files"),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok()),
        Some("text/event-stream")
    );
    assert_eq!(
        headers
            .get(header::CACHE_CONTROL)
            .and_then(|value| value.to_str().ok()),
        Some("no-cache")
    );
    assert_eq!(
        headers
            .get("x-accel-buffering")
            .and_then(|value| value.to_str().ok()),
        Some("no")
    );

    let chunks = chunks_until_done(&body);
    assert_eq!(
        chunk_types(&chunks),
        vec![
            "start-step",
            "tool-input-start",
            "tool-input-delta",
            "tool-call",
            "tool-input-end",
            "finish-step",
            "tool-result",
        ]
    );
    assert_eq!(
        chunks[1],
        json!({"type": "tool-input-start", "toolCallId": "session-123:tool-1", "toolName": "Bash"})
    );
    assert_eq!(chunks[2]["inputTextDelta"], "{\"command\":\"ls\"}");
    assert_eq!(
        chunks[3],
        json!({
            "type": "tool-call",
            "toolCallId": "session-123:tool-1",
            "toolName": "Bash",
            "input": {"command": "ls"}
        })
    );
    assert_eq!(
        chunks[5],
        json!({
            "type": "finish-step",
            "finishReason": "tool-calls",
            "usage": {"inputTokens": 1, "outputTokens": 5, "totalTokens": 6}
        })
    );
    assert_eq!(
        chunks[6],
        json!({
            "type": "tool-result",
            "toolCallId": "session-123:tool-1",
            "toolName": "Bash",
            "input": {"command": "ls"},
            "output": "ok"
        })
    );

    let invocation = test_app.backend.last_invocation().expect("backend invoked");
    assert_eq!(invocation.session_id, SESSION_ID);
    assert_eq!(invocation.model, "claude-sonnet-4-5");
    assert_eq!(invocation.prompt, "list the files");
}

#[tokio::test]
async fn text_turn_streams_canonical_chunks() {
    let test_app = TestApp::new(MockBackend::from_messages(scenario_b()));
    let (status, _, body) =
        send_prompt(&test_app.app, SESSION_ID, "", &test_app.prompt_body("greet")).await;
    assert_eq!(status, StatusCode::OK);

    let chunks = chunks_until_done(&body);
    assert_eq!(
        chunk_types(&chunks),
        vec![
            "start-step",
            "text-start",
            "text-delta",
            "text-delta",
            "text-end",
            "finish-step",
        ]
    );
    let text_id = chunks[1]["id"].clone();
    assert_eq!(text_id, "msg_b:0");
    assert_eq!(chunks[2], json!({"type": "text-delta", "id": text_id, "delta": "Hello"}));
    assert_eq!(chunks[3]["delta"], " world");
    assert_eq!(chunks[4], json!({"type": "text-end", "id": text_id}));
    assert_eq!(chunks[5]["finishReason"], "stop");
    assert_eq!(
        chunks[5]["usage"],
        json!({"inputTokens": 2, "outputTokens": 4, "totalTokens": 6})
    );
}

#[tokio::test]
async fn include_raw_attaches_native_messages() {
    let test_app = TestApp::new(MockBackend::from_messages(scenario_b()));
    let (_, _, body) = send_prompt(
        &test_app.app,
        SESSION_ID,
        "?include_raw=true",
        &test_app.prompt_body("greet"),
    )
    .await;
    let chunks = chunks_until_done(&body);
    assert_eq!(chunks[0]["raw"]["event"]["type"], "message_start");
    assert_eq!(chunks[2]["raw"]["event"]["delta"]["text"], "Hello");

    let (_, _, body) = send_prompt(
        &test_app.app,
        SESSION_ID,
        "",
        &test_app.prompt_body("greet"),
    )
    .await;
    let chunks = chunks_until_done(&body);
    assert!(chunks.iter().all(|chunk| chunk.get("raw").is_none()));
}

#[tokio::test]
async fn validation_errors_arrive_as_stream_errors() {
    let test_app = TestApp::new(MockBackend::from_messages(scenario_b()));
    let mut body = test_app.prompt_body("greet");
    body.as_object_mut()
        .expect("object")
        .remove("workingDirectory");
    let (status, headers, body) = send_prompt(&test_app.app, SESSION_ID, "", &body).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok()),
        Some("text/event-stream")
    );
    let chunks = chunks_until_done(&body);
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0]["type"], "error");
    assert_eq!(
        chunks[0]["errorText"],
        "session session-123 does not declare a working directory"
    );
    assert_eq!(test_app.backend.invocations(), 0);

    let mut body = test_app.prompt_body("greet");
    body["modelId"] = json!("mistral:large");
    let (_, _, body) = send_prompt(&test_app.app, SESSION_ID, "", &body).await;
    let chunks = chunks_until_done(&body);
    assert_eq!(chunk_types(&chunks), vec!["error"]);
    assert_eq!(chunks[0]["errorText"], "model not found: mistral:large");
    assert_eq!(test_app.backend.invocations(), 0);
}

#[tokio::test]
async fn mid_stream_failure_ends_with_error_then_done() {
    let mut steps: Vec<MockStep> = scenario_b()
        .into_iter()
        .take(3)
        .map(MockStep::Message)
        .collect();
    steps.push(MockStep::Fail("connection reset".to_string()));
    let test_app = TestApp::new(MockBackend::new(steps));
    let (status, _, body) =
        send_prompt(&test_app.app, SESSION_ID, "", &test_app.prompt_body("greet")).await;
    assert_eq!(status, StatusCode::OK);

    let chunks = chunks_until_done(&body);
    assert_eq!(
        chunk_types(&chunks),
        vec!["start-step", "text-start", "text-delta", "error"]
    );
    assert_eq!(chunks[3]["errorText"], "stream error: connection reset");
}

#[tokio::test]
async fn backend_start_failure_is_streamed() {
    let test_app = TestApp::new(MockBackend::default().with_start_error("claude not found"));
    let (_, _, body) =
        send_prompt(&test_app.app, SESSION_ID, "", &test_app.prompt_body("greet")).await;
    let chunks = chunks_until_done(&body);
    assert_eq!(
        chunks,
        vec![json!({"type": "error", "errorText": "provider error: claude not found"})]
    );
}

#[tokio::test]
async fn stalled_backend_times_out() {
    let backend = MockBackend::from_messages(scenario_b().into_iter().take(2)).hanging();
    let test_app = TestApp::with_timeout(backend, Duration::from_millis(300));
    let (status, _, body) =
        send_prompt(&test_app.app, SESSION_ID, "", &test_app.prompt_body("greet")).await;
    assert_eq!(status, StatusCode::OK);

    let chunks = chunks_until_done(&body);
    assert_eq!(chunk_types(&chunks), vec!["start-step", "text-start", "error"]);
    assert_eq!(chunks[2]["errorText"], "timeout: stream exceeded 300ms");
}

#[tokio::test]
async fn stream_head_arrives_before_agent_output() {
    let test_app = TestApp::new(MockBackend::from_messages(Vec::<Value>::new()).hanging());
    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("/v1/sessions/{SESSION_ID}/prompt"))
        .header("content-type", "application/json")
        .body(Body::from(test_app.prompt_body("greet").to_string()))
        .expect("request");
    let response = tokio::time::timeout(
        Duration::from_secs(2),
        test_app.app.clone().oneshot(request),
    )
    .await
    .expect("head is not held back")
    .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok()),
        Some("text/event-stream")
    );
}

#[tokio::test]
async fn malformed_body_is_rejected_before_streaming() {
    let test_app = TestApp::new(MockBackend::from_messages(scenario_b()));
    let (status, headers, body) = send_raw(
        &test_app.app,
        Method::POST,
        "/v1/sessions/session-123/prompt",
        Some("{\"prompt\": 42}".to_string()),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok()),
        Some("application/json")
    );
    let problem: Value = serde_json::from_str(&body).expect("problem json");
    assert_eq!(problem["type"], "urn:agent-relay:error:invalid_request");
    assert_eq!(problem["status"], 400);
    assert!(sse_data(&body).is_empty());
    assert_eq!(test_app.backend.invocations(), 0);
}
