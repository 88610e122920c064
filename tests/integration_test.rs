//! Integration tests for the chat proxy server.
//!
//! These tests drive the full router against a mock upstream and verify:
//! - Request retargeting and outbound headers
//! - The model policy gate
//! - Response relay header rules
//! - Stream tapping and usage records
//! - Deadline and redirect handling

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chat_proxy_rust::{
    api::{build_router, ProxyState},
    core::{init_metrics, AppConfig, TelemetryError, TelemetrySink},
    proxy::{build_http_client, Forwarder},
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;
use wiremock::{
    matchers::{body_json, body_string, header, header_exists, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

const CHAT_PATH: &str = "/api/openai/v1/chat/completions";

/// In-memory sink recording every ingested batch.
#[derive(Default)]
struct MemorySink {
    batches: Mutex<Vec<(String, Vec<Value>)>>,
    flushes: AtomicUsize,
}

impl MemorySink {
    fn records(&self) -> Vec<Value> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, records)| records.clone())
            .collect()
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn ingest(&self, dataset: &str, records: Vec<Value>) -> Result<(), TelemetryError> {
        self.batches
            .lock()
            .unwrap()
            .push((dataset.to_string(), records));
        Ok(())
    }

    async fn flush(&self) -> Result<(), TelemetryError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Create a test config pointing at the mock upstream
fn create_test_config(server: &MockServer) -> AppConfig {
    let mut config = AppConfig::default();
    config.upstream.base_url = server.uri();
    config
}

/// Create a test application, optionally with a telemetry sink
fn create_test_app(config: AppConfig, sink: Option<Arc<MemorySink>>) -> (Router, ProxyState) {
    init_metrics();

    let client = build_http_client(&config.upstream).expect("Failed to build HTTP client");
    let telemetry = sink.map(|sink| sink as Arc<dyn TelemetrySink>);
    let state = ProxyState::new(config, client, telemetry);
    (build_router(state.clone()), state)
}

fn chat_request(body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(CHAT_PATH)
        .header("authorization", "Bearer sk-test")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn chat_body(model: &str) -> Value {
    json!({
        "model": model,
        "stream": true,
        "messages": [
            {"role": "system", "content": "You are terse."},
            {"role": "user", "content": "Say hi"}
        ]
    })
}

fn sse_chunk(content: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
        })
    )
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn test_disallowed_model_is_rejected_without_upstream_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut config = create_test_config(&server);
    config.policy.disabled_model = Some("gpt-4".to_string());
    let (app, _) = create_test_app(config, None);

    let response = app
        .oneshot(chat_request(&chat_body("gpt-4-turbo")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(
        body,
        json!({"error": true, "message": "you are not allowed to use gpt-4 model"})
    );
}

#[tokio::test]
async fn test_allowed_request_is_forwarded_once_with_headers() {
    let server = MockServer::start().await;
    let request_body = chat_body("gpt-3.5-turbo");
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("content-type", "application/json"))
        .and(header("cache-control", "no-store"))
        .and(header("authorization", "Bearer sk-test"))
        .and(header("openai-organization", "org-test"))
        .and(body_json(&request_body))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-request-id", "req_upstream_123")
                .set_body_json(json!({"id": "chatcmpl-1"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut config = create_test_config(&server);
    config.upstream.org_id = Some("org-test".to_string());
    config.policy.disabled_model = Some("gpt-4".to_string());
    let (app, _) = create_test_app(config, None);

    let response = app.oneshot(chat_request(&request_body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-accel-buffering"], "no");
    assert_eq!(response.headers()["x-request-id"], "req_upstream_123");
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body, json!({"id": "chatcmpl-1"}));
}

#[tokio::test]
async fn test_ungated_request_is_forwarded_once_with_body() {
    let server = MockServer::start().await;
    let request_body = chat_body("gpt-4");
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_json(&request_body))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "chatcmpl-2"})))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = create_test_config(&server);
    config.policy.disabled_model = None;
    let (app, _) = create_test_app(config, None);

    let response = app.oneshot(chat_request(&request_body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body, json!({"id": "chatcmpl-2"}));
}

#[tokio::test]
async fn test_upstream_request_id_reaches_caller_unchanged() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-request-id", "req_upstream_123")
                .set_body_string("{\"data\":[]}"),
        )
        .mount(&server)
        .await;

    let (app, _) = create_test_app(create_test_config(&server), None);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/openai/v1/models")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let ids: Vec<_> = response.headers().get_all("x-request-id").iter().collect();
    assert_eq!(ids, vec!["req_upstream_123"]);
}

#[tokio::test]
async fn test_local_routes_carry_proxy_request_id() {
    let server = MockServer::start().await;
    let (app, _) = create_test_app(create_test_config(&server), None);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn test_get_forwards_path_and_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .and(query_param("limit", "2"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"data\":[]}"))
        .expect(1)
        .mount(&server)
        .await;

    let (app, _) = create_test_app(create_test_config(&server), None);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/openai/v1/models?limit=2")
                .header("authorization", "Bearer sk-test")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"{\"data\":[]}");
}

#[tokio::test]
async fn test_www_authenticate_is_stripped_from_upstream_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(
            ResponseTemplate::new(401)
                .insert_header("www-authenticate", "Bearer realm=\"OpenAI\"")
                .insert_header("x-request-origin", "upstream")
                .set_body_json(json!({"error": {"message": "Incorrect API key"}})),
        )
        .mount(&server)
        .await;

    let (app, _) = create_test_app(create_test_config(&server), None);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/openai/v1/models")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get("www-authenticate").is_none());
    assert_eq!(response.headers()["x-request-origin"], "upstream");
    assert_eq!(response.headers()["x-accel-buffering"], "no");
}

#[tokio::test]
async fn test_stream_is_relayed_and_usage_recorded_once() {
    let server = MockServer::start().await;
    let stream = format!(
        "{}{}{}data: [DONE]\n\n",
        sse_chunk("Hi"),
        sse_chunk(" there"),
        sse_chunk("!")
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(stream.clone(), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let sink = Arc::new(MemorySink::default());
    let mut config = create_test_config(&server);
    config.telemetry.dataset = "usage-test".to_string();
    let (app, state) = create_test_app(config, Some(sink.clone()));

    let request_body = chat_body("gpt-3.5-turbo");
    let response = app.oneshot(chat_request(&request_body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    assert_eq!(body_bytes(response).await, stream.as_bytes());

    state.background.close();
    tokio::time::timeout(Duration::from_secs(5), state.background.wait())
        .await
        .expect("usage accumulator should finish");

    let batches = sink.batches.lock().unwrap().clone();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].0, "usage-test");

    let records = sink.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    // "You are terse." + "Say hi" + "Hi there!"
    assert_eq!(record["tokens"], 14 + 6 + 9);
    assert_eq!(record["response"], "Hi there!");
    assert_eq!(record["key"], "sk-test");
    assert_eq!(record["model"], "gpt-3.5-turbo");
    assert_eq!(record["messages"], request_body["messages"]);
    assert_eq!(sink.flushes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_non_write_requests_are_not_tapped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(sse_chunk("ignored")))
        .mount(&server)
        .await;

    let sink = Arc::new(MemorySink::default());
    let (app, state) = create_test_app(create_test_config(&server), Some(sink.clone()));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/openai/v1/models")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_bytes(response).await;

    state.background.close();
    state.background.wait().await;
    assert!(sink.records().is_empty());
}

#[tokio::test]
async fn test_non_json_post_is_forwarded_raw_without_telemetry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/files"))
        .and(body_string("plain text upload"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let sink = Arc::new(MemorySink::default());
    let mut config = create_test_config(&server);
    config.policy.disabled_model = Some("gpt-4".to_string());
    let (app, state) = create_test_app(config, Some(sink.clone()));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/openai/v1/files")
                .body(Body::from("plain text upload"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    state.background.close();
    state.background.wait().await;
    assert!(sink.records().is_empty());
}

#[tokio::test]
async fn test_large_multipart_upload_is_streamed_to_upstream() {
    const UPLOAD_SIZE: usize = 12 * 1024 * 1024;

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/audio/transcriptions"))
        .and(|request: &wiremock::Request| request.body.len() == UPLOAD_SIZE)
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "hello"})))
        .expect(1)
        .mount(&server)
        .await;

    let sink = Arc::new(MemorySink::default());
    let mut config = create_test_config(&server);
    config.server.max_body_bytes = Some(1024 * 1024);
    config.policy.disabled_model = Some("gpt-4".to_string());
    let (app, state) = create_test_app(config, Some(sink.clone()));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/openai/v1/audio/transcriptions")
                .header("authorization", "Bearer sk-test")
                .header("content-type", "multipart/form-data; boundary=upload")
                .body(Body::from(vec![b'a'; UPLOAD_SIZE]))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    state.background.close();
    state.background.wait().await;
    assert!(sink.records().is_empty());
}

#[tokio::test]
async fn test_upstream_timeout_returns_gateway_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let config = create_test_config(&server);
    let (_, mut state) = create_test_app(config, None);
    state.forwarder = Forwarder::new(state.forwarder.client().clone(), Duration::from_millis(200));
    let app = build_router(state);

    let response = app
        .oneshot(chat_request(&chat_body("gpt-3.5-turbo")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["error"]["type"], "timeout_error");
}

#[tokio::test]
async fn test_redirect_is_surfaced_to_caller() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/moved"))
        .respond_with(
            ResponseTemplate::new(307).insert_header("location", "https://elsewhere.example/"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (app, _) = create_test_app(create_test_config(&server), None);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/openai/v1/moved")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers()["location"],
        "https://elsewhere.example/"
    );
}

#[tokio::test]
async fn test_health_reports_upstream_and_telemetry() {
    let server = MockServer::start().await;
    let sink = Arc::new(MemorySink::default());
    let (app, _) = create_test_app(create_test_config(&server), Some(sink));

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(
        body,
        json!({"status": "ok", "telemetry": true, "upstream": server.uri()})
    );
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_proxy_metrics() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (app, _) = create_test_app(create_test_config(&server), None);
    app.clone()
        .oneshot(
            Request::builder()
                .uri("/api/openai/v1/models")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(text.contains("chat_proxy_requests_total"));
}
