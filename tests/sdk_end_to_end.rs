//! Client SDK against a live pipeline server.

use std::sync::Arc;

use serde_json::{json, Value};
use telemetry_pipeline::config::PipelineConfig;
use telemetry_sdk::{
    CollectorConfig, ErrorRecord, FlushOutcome, HttpTransport, InstrumentedClient, MetricKind, StreamCounts,
    TelemetryCollector,
};

mod common;

fn collector_for(base_url: &str) -> TelemetryCollector {
    TelemetryCollector::new(Arc::new(HttpTransport::new(base_url)), CollectorConfig::default())
}

#[tokio::test]
async fn test_flush_delivers_batch_and_clears_buffers() {
    let server = common::TestServer::start(PipelineConfig::default()).await;
    let collector = collector_for(&server.base_url());
    collector.set_user_id("user-99");

    let vital_id = collector.record_metric(MetricKind::WebVital, json!({"name": "CLS", "value": 0.05}));
    collector.record_error(ErrorRecord::new("uncaught_error", "cannot read property").with_stack("at main"));
    collector.record_page_view("/checkout");
    for i in 0..12 {
        collector.record_interaction("click", json!({"target": format!("button-{i}")}));
    }

    assert_eq!(collector.flush(false).await, FlushOutcome::Sent { entries: 15 });
    assert_eq!(collector.pending(), StreamCounts::default());

    let vital = &server.sink.with_message("Web vital reported")[0];
    assert_eq!(vital.fields["client_correlation_id"], vital_id.as_str());
    assert_eq!(vital.fields["session_id"], collector.session_id().as_str());
    assert_eq!(vital.user_id.as_deref(), Some("user-99"));

    assert_eq!(server.sink.with_message("Frontend error").len(), 1);
    assert_eq!(server.sink.with_message("Page view")[0].fields["path"], "/checkout");
    // Indices 0 and 10 pass the default 1-in-10 sampling.
    assert_eq!(server.sink.with_message("User interaction").len(), 2);

    assert_eq!(collector.flush(false).await, FlushOutcome::Empty);
    server.stop().await;
}

#[tokio::test]
async fn test_failed_flush_retains_buffers() {
    let (backend, bodies) = common::start_recording_backend(vec![503, 200]).await;
    let collector = collector_for(&format!("http://{backend}"));

    collector.record_metric(MetricKind::BusinessEvent, json!({"event": "checkout"}));
    collector.record_error(ErrorRecord::new("promise_rejection", "payment timeout"));
    collector.record_page_view("/cart");
    let before = collector.pending();

    assert_eq!(collector.flush(false).await, FlushOutcome::Retained { entries: 3 });
    assert_eq!(collector.pending(), before);

    assert_eq!(collector.flush(false).await, FlushOutcome::Sent { entries: 3 });
    assert_eq!(collector.pending(), StreamCounts::default());

    let bodies = bodies.lock().unwrap();
    assert_eq!(bodies.len(), 2);
    let failed: Value = serde_json::from_slice(&bodies[0]).unwrap();
    let retried: Value = serde_json::from_slice(&bodies[1]).unwrap();
    for stream in ["metrics", "errors", "pageViews", "userInteractions"] {
        assert_eq!(retried[stream], failed[stream], "{stream} changed between attempts");
    }
    assert_eq!(retried["metrics"][0]["data"]["event"], "checkout");
    assert_eq!(retried["errors"][0]["message"], "payment timeout");
    assert_eq!(retried["pageViews"][0]["path"], "/cart");
}

#[tokio::test]
async fn test_correlation_id_joins_client_call_to_server_logs() {
    let server = common::TestServer::start(PipelineConfig::default()).await;
    let collector = collector_for(&server.base_url());
    let client = InstrumentedClient::new(common::client(), collector.clone());

    let res = client.send(client.client().get(server.url("/health"))).await.unwrap();
    let echoed = res.headers()["x-correlation-id"].to_str().unwrap().to_string();

    assert_eq!(collector.flush(false).await, FlushOutcome::Sent { entries: 1 });

    let api_call = &server.sink.with_message("Frontend API call")[0];
    assert_eq!(api_call.fields["client_correlation_id"], echoed.as_str());
    assert_eq!(api_call.fields["data"]["status"], 200);

    server.stop().await;
}
