//! Frontend telemetry ingestion (`POST /api/frontend-metrics`).
//!
//! # Responsibilities
//! - Accept one client batch and validate each entry on its own
//! - Dispatch metrics by type into log records at the matching severity
//! - Down-sample user interactions
//! - Report per-category processed and skipped counts
//!
//! # Design Decisions
//! - The body is parsed as untyped JSON so a malformed entry only skips itself
//! - Unknown metric types are still processed, logged at debug as unclassified
//! - The body limit is read from the hot-reloadable ingestion settings

use axum::{
    body::Body,
    extract::State,
    http::{header::CONTENT_LENGTH, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::http::correlation::CorrelationContext;
use crate::http::server::AppState;
use crate::observability::logging::{ContextLogger, RequestSnapshot};
use crate::observability::metrics;

/// Web vitals recorded as metric labels. Others are logged only.
const KNOWN_VITALS: [&str; 6] = ["CLS", "FCP", "FID", "INP", "LCP", "TTFB"];

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("failed to read request body: {0}")]
    BodyRead(#[source] axum::Error),

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),
}

impl IngestError {
    fn status(&self) -> StatusCode {
        match self {
            IngestError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        failure_response(self.status(), &self.to_string())
    }
}

/// `{success: false, error, timestamp}` with the given status.
pub fn failure_response(status: StatusCode, error: &str) -> Response {
    let body = json!({
        "success": false,
        "error": error,
        "timestamp": timestamp(),
    });
    (status, Json(body)).into_response()
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Per-category entry counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryCounts {
    pub metrics: u64,
    pub errors: u64,
    pub page_views: u64,
    pub user_interactions: u64,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub success: bool,
    pub processed: CategoryCounts,
    pub skipped: CategoryCounts,
    pub timestamp: String,
}

/// Handler for `POST /api/frontend-metrics`.
pub async fn ingest(
    State(state): State<AppState>,
    ctx: CorrelationContext,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<IngestResponse>, IngestError> {
    let settings = state.ingestion.load_full();
    let logger = state.logger.child(&ctx).with_field("component", "ingest");

    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    let read = match declared {
        Some(len) if len > settings.max_body_bytes => Err(IngestError::PayloadTooLarge {
            limit: settings.max_body_bytes,
        }),
        _ => axum::body::to_bytes(body, settings.max_body_bytes)
            .await
            .map_err(IngestError::BodyRead),
    };
    let bytes = match read {
        Ok(bytes) => bytes,
        Err(err) => {
            let snapshot = RequestSnapshot::capture(&method, &uri, &headers, &[], 0);
            logger.error_with_request("Frontend batch rejected", &err, Some(&snapshot), Value::Null);
            return Err(err);
        }
    };

    let batch = match parse_batch(&bytes) {
        Ok(batch) => batch,
        Err(err) => {
            let snapshot =
                RequestSnapshot::capture(&method, &uri, &headers, &bytes, state.config.logging.max_body_snapshot);
            logger.error_with_request("Frontend batch rejected", &err, Some(&snapshot), Value::Null);
            return Err(err);
        }
    };

    let outcome = process_batch(&batch, &logger, &state, settings.interaction_sample_rate);

    Ok(Json(IngestResponse {
        success: true,
        processed: outcome.processed,
        skipped: outcome.skipped,
        timestamp: timestamp(),
    }))
}

/// Top-level batch shape. Entries stay untyped until processed.
#[derive(Debug, Default)]
pub struct RawBatch {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub user_agent: Option<String>,
    pub url: Option<String>,
    pub metrics: Vec<Value>,
    pub errors: Vec<Value>,
    pub page_views: Vec<Value>,
    pub user_interactions: Vec<Value>,
}

/// Parse the batch envelope. Missing arrays are empty; non-array fields are rejected.
pub fn parse_batch(bytes: &[u8]) -> Result<RawBatch, IngestError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Value::Object(mut obj) = value else {
        return Err(IngestError::InvalidBatch("body must be a JSON object".into()));
    };

    fn take_array(obj: &mut Map<String, Value>, key: &str) -> Result<Vec<Value>, IngestError> {
        match obj.remove(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => Ok(items),
            Some(_) => Err(IngestError::InvalidBatch(format!("`{key}` must be an array"))),
        }
    }

    fn take_string(obj: &mut Map<String, Value>, key: &str) -> Option<String> {
        match obj.remove(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    Ok(RawBatch {
        metrics: take_array(&mut obj, "metrics")?,
        errors: take_array(&mut obj, "errors")?,
        page_views: take_array(&mut obj, "pageViews")?,
        user_interactions: take_array(&mut obj, "userInteractions")?,
        session_id: take_string(&mut obj, "sessionId"),
        user_id: take_string(&mut obj, "userId"),
        user_agent: take_string(&mut obj, "userAgent"),
        url: take_string(&mut obj, "url"),
    })
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub processed: CategoryCounts,
    pub skipped: CategoryCounts,
    /// Interactions that passed sampling and were logged.
    pub interactions_logged: u64,
}

/// Classify every entry of a batch into log records and counters.
pub fn process_batch(batch: &RawBatch, logger: &ContextLogger, state: &AppState, sample_rate: u32) -> BatchOutcome {
    let logger = logger
        .clone()
        .with_user(batch.user_id.clone())
        .with_field("source", "frontend")
        .with_field("session_id", batch.session_id.clone().unwrap_or_default());

    let mut outcome = BatchOutcome::default();

    logger.debug(
        "Frontend batch received",
        json!({
            "metrics": batch.metrics.len(),
            "errors": batch.errors.len(),
            "page_views": batch.page_views.len(),
            "user_interactions": batch.user_interactions.len(),
            "user_agent": batch.user_agent,
            "url": batch.url,
        }),
    );

    for entry in &batch.metrics {
        match log_metric(&logger, state, entry) {
            Ok(()) => outcome.processed.metrics += 1,
            Err(reason) => {
                outcome.skipped.metrics += 1;
                skip(&logger, "metrics", reason);
            }
        }
    }

    for entry in &batch.errors {
        match log_error(&logger, entry) {
            Ok(()) => outcome.processed.errors += 1,
            Err(reason) => {
                outcome.skipped.errors += 1;
                skip(&logger, "errors", reason);
            }
        }
    }

    for entry in &batch.page_views {
        match log_page_view(&logger, entry) {
            Ok(()) => outcome.processed.page_views += 1,
            Err(reason) => {
                outcome.skipped.page_views += 1;
                skip(&logger, "page_views", reason);
            }
        }
    }

    let every = u64::from(sample_rate.max(1));
    for (index, entry) in batch.user_interactions.iter().enumerate() {
        let sampled = index as u64 % every == 0;
        match log_interaction(&logger, entry, index, sampled) {
            Ok(logged) => {
                outcome.processed.user_interactions += 1;
                if logged {
                    outcome.interactions_logged += 1;
                }
            }
            Err(reason) => {
                outcome.skipped.user_interactions += 1;
                skip(&logger, "user_interactions", reason);
            }
        }
    }

    metrics::record_entries("metrics", outcome.processed.metrics);
    metrics::record_entries("errors", outcome.processed.errors);
    metrics::record_entries("page_views", outcome.processed.page_views);
    metrics::record_entries("user_interactions", outcome.processed.user_interactions);
    metrics::record_interactions_logged(outcome.interactions_logged);
    metrics::record_batch_size(
        batch.metrics.len() + batch.errors.len() + batch.page_views.len() + batch.user_interactions.len(),
    );

    let skipped = outcome.skipped.metrics
        + outcome.skipped.errors
        + outcome.skipped.page_views
        + outcome.skipped.user_interactions;
    if skipped > 0 {
        state.aggregator.increment_business("frontend_malformed_entries", skipped);
    }

    outcome
}

fn skip(logger: &ContextLogger, category: &'static str, reason: &'static str) {
    metrics::record_malformed(category);
    logger.warn("Malformed frontend entry skipped", json!({ "category": category, "reason": reason }));
}

fn as_object(entry: &Value) -> Result<&Map<String, Value>, &'static str> {
    entry.as_object().ok_or("entry is not an object")
}

fn string_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

/// Fields shared by every entry record.
fn base_fields(obj: &Map<String, Value>) -> Map<String, Value> {
    let mut fields = Map::new();
    if let Some(ts) = obj.get("timestamp") {
        fields.insert("client_timestamp".into(), ts.clone());
    }
    if let Some(id) = obj.get("correlationId") {
        fields.insert("client_correlation_id".into(), id.clone());
    }
    if let Some(url) = obj.get("url") {
        fields.insert("page_url".into(), url.clone());
    }
    fields
}

fn log_metric(logger: &ContextLogger, state: &AppState, entry: &Value) -> Result<(), &'static str> {
    let obj = as_object(entry)?;
    let kind = string_field(obj, "type").ok_or("missing metric type")?;
    let data = obj.get("data").cloned().unwrap_or(Value::Null);

    let mut fields = base_fields(obj);
    fields.insert("metric_type".into(), Value::String(kind.to_string()));
    fields.insert("data".into(), data.clone());
    let fields = Value::Object(fields);

    match kind {
        "web_vital" => {
            if let (Some(name), Some(value)) = (
                data.get("name").and_then(Value::as_str),
                data.get("value").and_then(Value::as_f64),
            ) {
                if KNOWN_VITALS.contains(&name) {
                    metrics::record_web_vital(name, value);
                }
            }
            logger.info("Web vital reported", fields);
        }
        "api_call" => logger.info("Frontend API call", fields),
        "page_load" => logger.info("Page load timing", fields),
        "business_event" => {
            let event = data
                .get("event")
                .or_else(|| data.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("business_event");
            state.aggregator.increment_business(event, 1);
            logger.info("Business event", fields);
        }
        "component_render" => logger.debug("Component render", fields),
        "performance_measurement" => logger.debug("Performance measurement", fields),
        _ => logger.debug("Unclassified frontend metric", fields),
    }
    Ok(())
}

fn log_error(logger: &ContextLogger, entry: &Value) -> Result<(), &'static str> {
    let obj = as_object(entry)?;
    let message = string_field(obj, "message").ok_or("missing error message")?;

    let mut fields = base_fields(obj);
    fields.insert(
        "error_type".into(),
        Value::String(string_field(obj, "type").unwrap_or("error").to_string()),
    );
    fields.insert("error_message".into(), Value::String(message.to_string()));
    fields.insert("stack".into(), obj.get("stack").cloned().unwrap_or(Value::Null));
    fields.insert("context".into(), obj.get("context").cloned().unwrap_or(Value::Null));

    logger.error("Frontend error", Value::Object(fields));
    Ok(())
}

fn log_page_view(logger: &ContextLogger, entry: &Value) -> Result<(), &'static str> {
    let obj = as_object(entry)?;
    let path = string_field(obj, "path").ok_or("missing page path")?;

    let mut fields = base_fields(obj);
    fields.insert("path".into(), Value::String(path.to_string()));
    logger.info("Page view", Value::Object(fields));
    Ok(())
}

/// Returns whether the interaction was logged.
fn log_interaction(logger: &ContextLogger, entry: &Value, index: usize, sampled: bool) -> Result<bool, &'static str> {
    let obj = as_object(entry)?;
    let kind = string_field(obj, "type").ok_or("missing interaction type")?;
    if !sampled {
        return Ok(false);
    }

    let mut fields = base_fields(obj);
    fields.insert("interaction_type".into(), Value::String(kind.to_string()));
    fields.insert("data".into(), obj.get("data").cloned().unwrap_or(Value::Null));
    fields.insert("sample_index".into(), Value::from(index));
    logger.info("User interaction", Value::Object(fields));
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::observability::aggregator::OVERFLOW_EVENT;
    use crate::observability::logging::{Level, MemorySink};
    use std::sync::Arc;

    fn state() -> (AppState, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (AppState::new(PipelineConfig::default(), sink.clone()), sink)
    }

    fn run(body: Value, rate: u32) -> (BatchOutcome, Arc<MemorySink>, AppState) {
        let (state, sink) = state();
        let batch = parse_batch(body.to_string().as_bytes()).unwrap();
        let outcome = process_batch(&batch, &state.logger, &state, rate);
        (outcome, sink, state)
    }

    #[test]
    fn test_counts_per_category() {
        let body = json!({
            "sessionId": "s1",
            "metrics": [
                {"type": "web_vital", "data": {"name": "LCP", "value": 1200.0}, "timestamp": 1},
                {"type": "api_call", "data": {"method": "GET"}, "timestamp": 2},
                {"type": "business_event", "data": {"event": "checkout"}, "timestamp": 3}
            ],
            "errors": [{"type": "TypeError", "message": "x is undefined", "stack": "at foo", "timestamp": 4}],
            "pageViews": [{"path": "/", "timestamp": 5}, {"path": "/cart", "timestamp": 6}],
            "userInteractions": [],
            "userAgent": "test",
            "url": "http://localhost/"
        });
        let (outcome, sink, state) = run(body, 10);

        assert_eq!(
            outcome.processed,
            CategoryCounts { metrics: 3, errors: 1, page_views: 2, user_interactions: 0 }
        );
        assert_eq!(outcome.skipped, CategoryCounts::default());
        assert_eq!(state.aggregator.snapshot().business.get("checkout"), Some(&1));

        let error = &sink.with_message("Frontend error")[0];
        assert_eq!(error.level, Level::Error);
        assert_eq!(error.fields["stack"], "at foo");
        assert_eq!(sink.with_message("Page view").len(), 2);
    }

    #[test]
    fn test_severity_by_metric_type() {
        let body = json!({
            "metrics": [
                {"type": "component_render", "data": {}},
                {"type": "performance_measurement", "data": {}},
                {"type": "page_load", "data": {}},
                {"type": "something_new", "data": {}}
            ]
        });
        let (outcome, sink, _) = run(body, 10);
        assert_eq!(outcome.processed.metrics, 4);
        assert_eq!(sink.with_message("Component render")[0].level, Level::Debug);
        assert_eq!(sink.with_message("Performance measurement")[0].level, Level::Debug);
        assert_eq!(sink.with_message("Page load timing")[0].level, Level::Info);
        assert_eq!(sink.with_message("Unclassified frontend metric")[0].level, Level::Debug);
    }

    #[test]
    fn test_interactions_sampled_by_index() {
        let interactions: Vec<Value> = (0..100).map(|i| json!({"type": "click", "data": {"i": i}})).collect();
        let (outcome, sink, _) = run(json!({ "userInteractions": interactions }), 10);

        assert_eq!(outcome.processed.user_interactions, 100);
        assert_eq!(outcome.interactions_logged, 10);
        let indices: Vec<u64> = sink
            .with_message("User interaction")
            .iter()
            .map(|r| r.fields["sample_index"].as_u64().unwrap())
            .collect();
        assert_eq!(indices, (0..100).step_by(10).collect::<Vec<u64>>());
    }

    #[test]
    fn test_malformed_entry_is_skipped() {
        let body = json!({
            "metrics": [
                {"type": "api_call", "data": {}},
                "not an object",
                {"data": {}},
                {"type": "web_vital", "data": {"name": "CLS", "value": 0.1}}
            ],
            "pageViews": [{"timestamp": 1}]
        });
        let (outcome, sink, state) = run(body, 10);

        assert_eq!(outcome.processed.metrics, 2);
        assert_eq!(outcome.skipped.metrics, 2);
        assert_eq!(outcome.skipped.page_views, 1);
        assert_eq!(sink.with_message("Malformed frontend entry skipped").len(), 3);
        assert_eq!(state.aggregator.snapshot().business.get("frontend_malformed_entries"), Some(&3));
    }

    #[test]
    fn test_distinct_business_events_are_bounded() {
        let events: Vec<Value> = (0..5000)
            .map(|i| json!({"type": "business_event", "data": {"event": format!("promo_{i}")}}))
            .collect();
        let (outcome, sink, state) = run(json!({ "metrics": events }), 10);
        assert_eq!(outcome.processed.metrics, 5000);
        assert_eq!(sink.with_message("Business event").len(), 5000);

        let cap = state.config.metrics.max_business_events;
        let business = state.aggregator.snapshot().business;
        assert_eq!(business.len(), cap + 1);
        assert_eq!(business[OVERFLOW_EVENT], 5000 - cap as u64);
    }

    #[test]
    fn test_records_carry_batch_identity() {
        let body = json!({
            "sessionId": "session_1",
            "userId": "user-7",
            "pageViews": [{"path": "/", "correlationId": "corr-9"}]
        });
        let (_, sink, _) = run(body, 10);
        let record = &sink.with_message("Page view")[0];
        assert_eq!(record.user_id.as_deref(), Some("user-7"));
        assert_eq!(record.fields["session_id"], "session_1");
        assert_eq!(record.fields["client_correlation_id"], "corr-9");
    }

    #[test]
    fn test_envelope_validation() {
        assert!(matches!(parse_batch(b"[]"), Err(IngestError::InvalidBatch(_))));
        assert!(matches!(parse_batch(b"{not json"), Err(IngestError::InvalidJson(_))));
        assert!(matches!(
            parse_batch(br#"{"metrics": {}}"#),
            Err(IngestError::InvalidBatch(_))
        ));
        let empty = parse_batch(b"{}").unwrap();
        assert!(empty.metrics.is_empty() && empty.user_interactions.is_empty());
    }
}
