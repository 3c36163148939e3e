//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with all handlers
//! - Wire up middleware (request id, tracing, correlation, metrics, timeout, panics)
//! - Apply hot-reloaded ingestion settings
//! - Serve until shutdown is signalled
//!
//! # Middleware Order (outermost first)
//! ```text
//! SetRequestId (X-Correlation-Id generated if absent)
//!   → correlate (sanitized id, CorrelationContext, X-Trace-Id)
//!   → TraceLayer (span carries the correlation id)
//!   → PropagateRequestId (echo X-Correlation-Id)
//!   → log_requests (started/completed records, routes and fallback)
//!   → track_requests (aggregator, per matched route)
//!   → timeout_as_json → TimeoutLayer → CatchPanicLayer → handler
//! ```

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::{
    body::{Body, HttpBody as _},
    extract::{MatchedPath, Request, State},
    http::{
        header::{CONTENT_LENGTH, USER_AGENT},
        HeaderMap, Method, StatusCode, Uri,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::{IngestionConfig, PipelineConfig};
use crate::http::correlation::{self, correlation_header, CorrelationContext, MakeCorrelationId, X_CORRELATION_ID};
use crate::http::{exposition, ingest};
use crate::observability::aggregator::MetricsAggregator;
use crate::observability::logging::{ContextLogger, LogSink, TracingSink};

/// Route label for requests that matched no route.
pub const UNMATCHED_ROUTE: &str = "unmatched";

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<MetricsAggregator>,
    pub logger: ContextLogger,
    /// Reloadable without restart.
    pub ingestion: Arc<ArcSwap<IngestionConfig>>,
    pub config: Arc<PipelineConfig>,
    /// Set while the server accepts traffic; cleared once shutdown begins.
    pub ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(config: PipelineConfig, sink: Arc<dyn LogSink>) -> Self {
        let prefix = exposition::metric_prefix(&config.service.name);
        Self {
            aggregator: Arc::new(MetricsAggregator::new(&config.metrics, &prefix)),
            logger: ContextLogger::new(config.service.clone(), sink),
            ingestion: Arc::new(ArcSwap::from_pointee(config.ingestion.clone())),
            config: Arc::new(config),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Swap in reloaded ingestion settings. Returns whether anything changed.
    pub fn apply_config(&self, config: &PipelineConfig) -> bool {
        if **self.ingestion.load() == config.ingestion {
            return false;
        }
        self.ingestion.store(Arc::new(config.ingestion.clone()));
        tracing::info!(
            interaction_sample_rate = config.ingestion.interaction_sample_rate,
            max_body_bytes = config.ingestion.max_body_bytes,
            "Ingestion settings reloaded"
        );
        if config.listener != self.config.listener || config.metrics != self.config.metrics {
            tracing::warn!("Listener and metrics settings changed; restart required to apply them");
        }
        true
    }
}

/// HTTP server for the telemetry pipeline.
pub struct HttpServer {
    router: Router,
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server logging through `tracing`.
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_log_sink(config, Arc::new(TracingSink))
    }

    /// Create a new HTTP server writing contextual log records to `sink`.
    pub fn with_log_sink(config: PipelineConfig, sink: Arc<dyn LogSink>) -> Self {
        let state = AppState::new(config, sink);
        let router = Self::build_router(state.clone());
        Self { router, state }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState) -> Router {
        let request_timeout = Duration::from_secs(state.config.timeouts.request_secs);

        let routes = Router::new()
            .route("/api/frontend-metrics", post(ingest::ingest))
            .route("/metrics", get(exposition::prometheus))
            .route("/api/metrics", get(exposition::snapshot))
            .route("/health", get(exposition::health))
            .route("/health/ready", get(exposition::readiness))
            .route("/health/live", get(exposition::liveness));

        with_route_layers(routes, state.aggregator.clone(), request_timeout)
            .fallback(not_found)
            .layer(middleware::from_fn_with_state(state.clone(), log_requests))
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::new(correlation_header(), MakeCorrelationId))
                    .layer(middleware::from_fn(correlation::correlate))
                    .layer(TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<Body>| {
                        let correlation_id = request
                            .headers()
                            .get(X_CORRELATION_ID)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("-");
                        tracing::info_span!(
                            "request",
                            method = %request.method(),
                            uri = %request.uri(),
                            correlation_id = %correlation_id,
                        )
                    }))
                    .layer(PropagateRequestIdLayer::new(correlation_header())),
            )
    }

    /// Shared state, including the aggregator and reloadable settings.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn aggregator(&self) -> Arc<MetricsAggregator> {
        self.state.aggregator.clone()
    }

    /// Run the server, accepting connections on the given listener.
    ///
    /// Reloaded configs arriving on `config_updates` are applied while serving.
    /// Returns once `shutdown` fires and in-flight requests have drained.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<PipelineConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let state = self.state.clone();
        let ready = self.state.ready.clone();
        let reload = tokio::spawn(async move {
            while let Some(config) = config_updates.recv().await {
                state.apply_config(&config);
            }
        });

        ready.store(true, Ordering::Release);
        let draining = ready.clone();
        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                draining.store(false, Ordering::Release);
                tracing::info!("Shutdown signal received");
            })
            .await?;
        ready.store(false, Ordering::Release);

        reload.abort();
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Per-route guards. Each `route_layer` wraps the previous one, so the last
/// added runs first.
fn with_route_layers(
    routes: Router<AppState>,
    aggregator: Arc<MetricsAggregator>,
    request_timeout: Duration,
) -> Router<AppState> {
    routes
        .route_layer(CatchPanicLayer::custom(panic_response))
        .route_layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, request_timeout))
        .route_layer(middleware::map_response(timeout_as_json))
        .route_layer(middleware::from_fn_with_state(aggregator, track_requests))
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn response_size(response: &Response) -> Option<u64> {
    content_length(response.headers()).or_else(|| response.body().size_hint().exact())
}

/// Feed every routed request into the aggregator.
async fn track_requests(State(aggregator): State<Arc<MetricsAggregator>>, request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());
    let method = request.method().to_string();
    let guard = aggregator.start_request(&method, &route, content_length(request.headers()));

    let response = next.run(request).await;

    guard.finish(response.status().as_u16(), response_size(&response));
    response
}

/// Log the start and completion of every request under its correlation id.
async fn log_requests(State(state): State<AppState>, ctx: CorrelationContext, request: Request, next: Next) -> Response {
    let logger = state.logger.child(&ctx).with_field("component", "http");
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    logger.info(
        "Request started",
        json!({
            "method": method,
            "path": path,
            "user_agent": request
                .headers()
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown"),
        }),
    );

    let started = Instant::now();
    let response = next.run(request).await;
    let duration_ms = (started.elapsed().as_secs_f64() * 100_000.0).round() / 100.0;

    let status = response.status();
    let fields = json!({
        "method": method,
        "path": path,
        "status_code": status.as_u16(),
        "duration_ms": duration_ms,
        "response_size": response_size(&response),
    });
    if status.as_u16() >= 400 {
        logger.warn("Request completed with error", fields);
    } else {
        logger.info("Request completed", fields);
    }
    response
}

/// Give the timeout layer's empty 408 the same JSON shape as other failures.
async fn timeout_as_json(response: Response) -> Response {
    if response.status() == StatusCode::REQUEST_TIMEOUT && response.body().size_hint().exact() == Some(0) {
        return ingest::failure_response(StatusCode::REQUEST_TIMEOUT, "Request timed out");
    }
    response
}

async fn not_found(State(state): State<AppState>, ctx: CorrelationContext, method: Method, uri: Uri) -> Response {
    let guard = state.aggregator.start_request(method.as_str(), UNMATCHED_ROUTE, None);
    guard.finish(StatusCode::NOT_FOUND.as_u16(), None);
    state
        .logger
        .child(&ctx)
        .warn("Route not found", json!({ "method": method.as_str(), "path": uri.path() }));
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Endpoint not found",
            "path": uri.path(),
            "correlation_id": ctx.correlation_id,
        })),
    )
        .into_response()
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "Request handler panicked");
    ingest::failure_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}
