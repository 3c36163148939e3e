//! Instrumentation for outbound calls and timed computations.
//!
//! Telemetry is always a side effect here: the wrapped call's response or
//! error is handed back to the caller exactly as produced.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Client, Request, RequestBuilder, Response, StatusCode};
use serde_json::json;

use crate::collector::TelemetryCollector;
use crate::event::{new_correlation_id, MetricKind, CORRELATION_HEADER};

/// Called when the server reports the session is no longer authenticated.
pub trait ReauthHandler: Send + Sync {
    fn reauthenticate(&self);
}

impl<F> ReauthHandler for F
where
    F: Fn() + Send + Sync,
{
    fn reauthenticate(&self) {
        self()
    }
}

/// HTTP client that tags every call with a correlation id and records it.
#[derive(Clone)]
pub struct InstrumentedClient {
    client: Client,
    collector: TelemetryCollector,
    reauth: Option<Arc<dyn ReauthHandler>>,
}

impl InstrumentedClient {
    pub fn new(client: Client, collector: TelemetryCollector) -> Self {
        Self { client, collector, reauth: None }
    }

    pub fn with_reauth_handler(mut self, handler: Arc<dyn ReauthHandler>) -> Self {
        self.reauth = Some(handler);
        self
    }

    /// The underlying client, for building requests.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Build and execute `builder`.
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response, reqwest::Error> {
        let request = builder.build()?;
        self.execute(request).await
    }

    /// Execute `request`, reusing its correlation header if it already has one.
    pub async fn execute(&self, mut request: Request) -> Result<Response, reqwest::Error> {
        let header = HeaderName::from_static(CORRELATION_HEADER);
        let existing = request
            .headers()
            .get(&header)
            .and_then(|v| v.to_str().ok())
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let correlation_id = match existing {
            Some(id) => id,
            None => {
                let id = new_correlation_id();
                if let Ok(value) = HeaderValue::from_str(&id) {
                    request.headers_mut().insert(header, value);
                }
                id
            }
        };

        let method = request.method().to_string();
        let url = request.url().to_string();
        let dispatched = Instant::now();

        let result = self.client.execute(request).await;

        let duration_ms = dispatched.elapsed().as_secs_f64() * 1000.0;
        let (status, error) = match &result {
            Ok(resp) => (Some(resp.status()), None),
            Err(e) => (e.status(), Some(e.to_string())),
        };
        self.observe(&method, &url, &correlation_id, duration_ms, status, error);

        result
    }

    fn observe(
        &self,
        method: &str,
        url: &str,
        correlation_id: &str,
        duration_ms: f64,
        status: Option<StatusCode>,
        error: Option<String>,
    ) {
        let status_code = status.map(|s| s.as_u16());
        self.collector.record_metric_correlated(
            MetricKind::ApiCall,
            json!({
                "method": method,
                "url": url,
                "duration": duration_ms,
                "status": status_code,
                "error": error,
            }),
            correlation_id,
        );

        match status {
            Some(StatusCode::UNAUTHORIZED) => {
                self.collector.record_metric_correlated(
                    MetricKind::BusinessEvent,
                    json!({ "event": "session_invalidated", "url": url }),
                    correlation_id,
                );
                if let Some(handler) = &self.reauth {
                    if catch_unwind(AssertUnwindSafe(|| handler.reauthenticate())).is_err() {
                        tracing::warn!(correlation_id, "Re-authentication handler panicked");
                    }
                }
            }
            Some(s) if s.is_server_error() => {
                self.collector.record_metric_correlated(
                    MetricKind::BusinessEvent,
                    json!({ "event": "server_error", "status": s.as_u16(), "url": url }),
                    correlation_id,
                );
            }
            _ => {}
        }
    }
}

/// Records one performance measurement when dropped.
struct Measurement<'a> {
    collector: &'a TelemetryCollector,
    name: &'a str,
    started: Instant,
    succeeded: Option<bool>,
}

impl Drop for Measurement<'_> {
    fn drop(&mut self) {
        let status = match self.succeeded {
            Some(true) => "success",
            Some(false) => "error",
            None => "aborted",
        };
        self.collector.record_metric(
            MetricKind::PerformanceMeasurement,
            json!({
                "name": self.name,
                "duration": self.started.elapsed().as_secs_f64() * 1000.0,
                "success": self.succeeded == Some(true),
                "status": status,
            }),
        );
    }
}

impl TelemetryCollector {
    /// Time `fut`, record exactly one measurement, and return its output untouched.
    ///
    /// If the future is dropped before completing, the measurement is still
    /// recorded with status `aborted`.
    pub async fn measure<F, T, E>(&self, name: &str, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let mut measurement = Measurement { collector: self, name, started: Instant::now(), succeeded: None };
        let result = fut.await;
        measurement.succeeded = Some(result.is_ok());
        result
    }

    /// Synchronous counterpart of [`TelemetryCollector::measure`].
    pub fn measure_sync<T, E>(&self, name: &str, f: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        let mut measurement = Measurement { collector: self, name, started: Instant::now(), succeeded: None };
        let result = f();
        measurement.succeeded = Some(result.is_ok());
        result
    }
}
