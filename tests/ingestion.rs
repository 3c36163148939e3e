//! End-to-end tests for batch ingestion, correlation and exposition.

use std::time::Duration;

use reqwest::header::HeaderValue;
use reqwest::StatusCode;
use serde_json::{json, Value};
use telemetry_pipeline::config::PipelineConfig;
use telemetry_pipeline::observability::logging::Level;

mod common;

fn sample_batch() -> Value {
    json!({
        "sessionId": "session_abc",
        "userId": "user-1",
        "metrics": [
            {"type": "web_vital", "data": {"name": "LCP", "value": 1800.0}, "timestamp": 1},
            {"type": "api_call", "data": {"method": "GET", "url": "/api/products", "status": 200}, "timestamp": 2},
            {"type": "component_render", "data": {"component": "ProductList"}, "timestamp": 3}
        ],
        "errors": [
            {"type": "uncaught_error", "message": "boom", "stack": "at render", "context": {"line": 12}, "timestamp": 4}
        ],
        "pageViews": [
            {"path": "/", "timestamp": 5},
            {"path": "/products", "timestamp": 6}
        ],
        "userInteractions": [],
        "userAgent": "integration-test",
        "url": "http://localhost:3000/"
    })
}

#[tokio::test]
async fn test_batch_counts_per_category() {
    let server = common::TestServer::start(PipelineConfig::default()).await;

    let res = common::client()
        .post(server.url("/api/frontend-metrics"))
        .json(&sample_batch())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body: Value = res.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(
        body["processed"],
        json!({"metrics": 3, "errors": 1, "pageViews": 2, "userInteractions": 0})
    );
    assert!(body["timestamp"].is_string());

    let errors = server.sink.with_message("Frontend error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].level, Level::Error);
    assert_eq!(errors[0].fields["context"]["line"], 12);

    server.stop().await;
}

#[tokio::test]
async fn test_correlation_id_generated_when_absent() {
    let server = common::TestServer::start(PipelineConfig::default()).await;

    let res = common::client().get(server.url("/health")).send().await.unwrap();
    let id = res.headers().get("x-correlation-id").unwrap().to_str().unwrap();
    assert!(uuid::Uuid::parse_str(id).is_ok());
    assert!(res.headers().get("x-trace-id").is_none());

    server.stop().await;
}

#[tokio::test]
async fn test_correlation_id_echoed_and_bound_to_logs() {
    let server = common::TestServer::start(PipelineConfig::default()).await;

    let res = common::client()
        .post(server.url("/api/frontend-metrics"))
        .header("X-Correlation-Id", "client-chain-42")
        .json(&sample_batch())
        .send()
        .await
        .unwrap();
    assert_eq!(res.headers()["x-correlation-id"], "client-chain-42");

    let records = server.sink.records();
    assert!(!records.is_empty());
    assert!(records
        .iter()
        .all(|r| r.correlation_id.as_deref() == Some("client-chain-42")));

    server.stop().await;
}

#[tokio::test]
async fn test_non_ascii_correlation_id_replaced_consistently() {
    let server = common::TestServer::start(PipelineConfig::default()).await;

    let res = common::client()
        .post(server.url("/api/frontend-metrics"))
        .header("X-Correlation-Id", HeaderValue::from_bytes(b"caf\xe9-42").unwrap())
        .json(&json!({"pageViews": [{"path": "/"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let echoed = res.headers()["x-correlation-id"].to_str().unwrap().to_string();
    assert!(uuid::Uuid::parse_str(&echoed).is_ok());

    let page_view = &server.sink.with_message("Page view")[0];
    assert_eq!(page_view.correlation_id.as_deref(), Some(echoed.as_str()));
    assert!(server
        .sink
        .records()
        .iter()
        .all(|r| r.correlation_id.as_deref() == Some(echoed.as_str())));

    server.stop().await;
}

#[tokio::test]
async fn test_requests_logged_on_start_and_completion() {
    let server = common::TestServer::start(PipelineConfig::default()).await;
    let client = common::client();

    let res = client
        .get(server.url("/health"))
        .header("X-Correlation-Id", "health-check-1")
        .header("User-Agent", "uptime-checker/2.1")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let started = &server.sink.with_message("Request started")[0];
    assert_eq!(started.level, Level::Info);
    assert_eq!(started.correlation_id.as_deref(), Some("health-check-1"));
    assert_eq!(started.fields["path"], "/health");
    assert_eq!(started.fields["user_agent"], "uptime-checker/2.1");

    let completed = &server.sink.with_message("Request completed")[0];
    assert_eq!(completed.level, Level::Info);
    assert_eq!(completed.correlation_id.as_deref(), Some("health-check-1"));
    assert_eq!(completed.fields["method"], "GET");
    assert_eq!(completed.fields["status_code"], 200);
    assert!(completed.fields["duration_ms"].as_f64().unwrap() >= 0.0);
    assert!(completed.fields["response_size"].as_u64().unwrap() > 0);

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_route_logs_warning_with_correlation_id() {
    let server = common::TestServer::start(PipelineConfig::default()).await;

    let res = common::client()
        .get(server.url("/no/such/route"))
        .header("X-Correlation-Id", "lost-7")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(res.headers()["x-correlation-id"], "lost-7");

    let body: Value = res.json().await.unwrap();
    assert_eq!(body["path"], "/no/such/route");
    assert_eq!(body["correlation_id"], "lost-7");

    let warning = &server.sink.with_message("Route not found")[0];
    assert_eq!(warning.level, Level::Warn);
    assert_eq!(warning.correlation_id.as_deref(), Some("lost-7"));

    let completed = &server.sink.with_message("Request completed with error")[0];
    assert_eq!(completed.level, Level::Warn);
    assert_eq!(completed.fields["status_code"], 404);

    server.stop().await;
}

#[tokio::test]
async fn test_readiness_and_liveness() {
    let server = common::TestServer::start(PipelineConfig::default()).await;
    let client = common::client();

    let ready = client.get(server.url("/health/ready")).send().await.unwrap();
    assert_eq!(ready.status(), StatusCode::OK);
    let body: Value = ready.json().await.unwrap();
    assert_eq!(body["status"], "ready");

    let live = client.get(server.url("/health/live")).send().await.unwrap();
    assert_eq!(live.status(), StatusCode::OK);
    let body: Value = live.json().await.unwrap();
    assert_eq!(body["status"], "alive");

    let state = server.state.clone();
    server.stop().await;
    assert!(!state.is_ready());
}

#[tokio::test]
async fn test_trace_id_echoed_when_trace_context_active() {
    let server = common::TestServer::start(PipelineConfig::default()).await;

    let res = common::client()
        .post(server.url("/api/frontend-metrics"))
        .header("traceparent", "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
        .json(&json!({"pageViews": [{"path": "/"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.headers()["x-trace-id"], "4bf92f3577b34da6a3ce929d0e0e4736");

    let record = &server.sink.with_message("Page view")[0];
    assert_eq!(record.trace_id.as_deref(), Some("4bf92f3577b34da6a3ce929d0e0e4736"));
    assert_eq!(record.span_id.as_ref().map(String::len), Some(16));

    server.stop().await;
}

#[tokio::test]
async fn test_interactions_sampled_one_in_ten() {
    let server = common::TestServer::start(PipelineConfig::default()).await;
    let interactions: Vec<Value> = (0..100).map(|i| json!({"type": "click", "data": {"n": i}})).collect();

    let res = common::client()
        .post(server.url("/api/frontend-metrics"))
        .json(&json!({ "sessionId": "s", "userInteractions": interactions }))
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["processed"]["userInteractions"], 100);

    let logged: Vec<u64> = server
        .sink
        .with_message("User interaction")
        .iter()
        .map(|r| r.fields["sample_index"].as_u64().unwrap())
        .collect();
    assert_eq!(logged, vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90]);

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_entry_does_not_abort_batch() {
    let server = common::TestServer::start(PipelineConfig::default()).await;

    let res = common::client()
        .post(server.url("/api/frontend-metrics"))
        .json(&json!({
            "metrics": [
                {"type": "api_call", "data": {}},
                42,
                {"type": "page_load", "data": {"loadTime": 900}}
            ],
            "errors": [{"type": "error"}],
            "pageViews": [{"path": "/"}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body: Value = res.json().await.unwrap();
    assert_eq!(body["processed"]["metrics"], 2);
    assert_eq!(body["processed"]["errors"], 0);
    assert_eq!(body["processed"]["pageViews"], 1);
    assert_eq!(body["skipped"]["metrics"], 1);
    assert_eq!(body["skipped"]["errors"], 1);

    server.stop().await;
}

#[tokio::test]
async fn test_invalid_body_rejected() {
    let server = common::TestServer::start(PipelineConfig::default()).await;
    let client = common::client();

    let res = client
        .post(server.url("/api/frontend-metrics"))
        .header("content-type", "application/json")
        .body("[1, 2, 3]")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("JSON object"));

    let rejected = server.sink.with_message("Frontend batch rejected");
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].fields["request"]["body"], "[1, 2, 3]");

    server.stop().await;
}

#[tokio::test]
async fn test_oversized_body_rejected() {
    let mut config = PipelineConfig::default();
    config.ingestion.max_body_bytes = 64;
    let server = common::TestServer::start(config).await;

    let interactions: Vec<Value> = (0..20).map(|_| json!({"type": "click"})).collect();
    let res = common::client()
        .post(server.url("/api/frontend-metrics"))
        .json(&json!({ "userInteractions": interactions }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);

    server.stop().await;
}

#[tokio::test]
async fn test_sample_rate_reloads_without_restart() {
    let server = common::TestServer::start(PipelineConfig::default()).await;

    let mut reloaded = PipelineConfig::default();
    reloaded.ingestion.interaction_sample_rate = 25;
    server.config_tx.send(reloaded).unwrap();

    let ingestion = server.state.ingestion.clone();
    assert!(
        common::wait_until(Duration::from_secs(2), || ingestion.load().interaction_sample_rate == 25).await
    );

    let interactions: Vec<Value> = (0..100).map(|_| json!({"type": "submit"})).collect();
    common::client()
        .post(server.url("/api/frontend-metrics"))
        .json(&json!({ "userInteractions": interactions }))
        .send()
        .await
        .unwrap();
    assert_eq!(server.sink.with_message("User interaction").len(), 4);

    server.stop().await;
}

#[tokio::test]
async fn test_metrics_exposition() {
    let server = common::TestServer::start(PipelineConfig::default()).await;
    let client = common::client();

    client
        .post(server.url("/api/frontend-metrics"))
        .json(&json!({"metrics": [{"type": "business_event", "data": {"event": "checkout"}}]}))
        .send()
        .await
        .unwrap();
    let missing = client.get(server.url("/no/such/route")).send().await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let res = client.get(server.url("/metrics")).send().await.unwrap();
    assert!(res.headers()["content-type"].to_str().unwrap().starts_with("text/plain"));
    let text = res.text().await.unwrap();

    assert!(text.contains(
        "telemetry_pipeline_http_requests_total{method=\"POST\",route=\"/api/frontend-metrics\",status_code=\"200\"} 1"
    ));
    assert!(text.contains("telemetry_pipeline_http_requests_total{method=\"GET\",route=\"unmatched\",status_code=\"404\"} 1"));
    assert!(text.contains("telemetry_pipeline_business_events_total{event=\"checkout\"} 1"));
    assert!(text.contains("# TYPE telemetry_pipeline_http_requests_total counter"));
    assert!(text.contains("# TYPE telemetry_pipeline_http_request_duration_seconds histogram"));
    assert!(text.contains("telemetry_pipeline_active_requests"));
    assert!(text.contains(
        "telemetry_pipeline_http_request_size_bytes_count{method=\"POST\",route=\"/api/frontend-metrics\"} 1"
    ));

    let snapshot: Value = client.get(server.url("/api/metrics")).send().await.unwrap().json().await.unwrap();
    assert_eq!(snapshot["service"], "telemetry-pipeline");
    assert!(snapshot["metrics"]["total_requests"].as_u64().unwrap() >= 3);

    server.stop().await;
}
