//! Per-request correlation identity.
//!
//! # Responsibilities
//! - Honour an inbound `X-Correlation-Id`, otherwise generate a UUID v4
//! - Replace inbound ids that are not short visible ASCII, so the echoed
//!   header and every log record carry the same value
//! - Capture trace/span identifiers when a trace context is active
//! - Store the context in request extensions, never in shared state
//! - Echo `X-Trace-Id` on the response when a trace context is active
//!
//! # Design Decisions
//! - Generation and echo of the correlation header reuse tower-http's
//!   request-id layers; this module supplies the id maker
//! - The context is an extractor so handlers take it by value

use std::convert::Infallible;

use axum::{
    extract::{FromRequestParts, Request},
    http::{request::Parts, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tower_http::request_id::{MakeRequestId, RequestId};
use uuid::Uuid;

use crate::observability::tracing::{self as trace_ctx, TraceContext, X_TRACE_ID};

/// Correlation header name (`X-Correlation-Id`).
pub const X_CORRELATION_ID: &str = "x-correlation-id";

/// Longest inbound correlation id that is kept.
pub const MAX_CORRELATION_ID_LEN: usize = 128;

/// The inbound id as a string, if it is non-empty visible ASCII within
/// [`MAX_CORRELATION_ID_LEN`].
pub fn usable_correlation_id(value: &HeaderValue) -> Option<String> {
    let bytes = value.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_CORRELATION_ID_LEN || !bytes.iter().all(u8::is_ascii_graphic) {
        return None;
    }
    value.to_str().ok().map(str::to_string)
}

pub fn correlation_header() -> HeaderName {
    HeaderName::from_static(X_CORRELATION_ID)
}

/// Generates UUID v4 correlation ids for requests that arrive without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeCorrelationId;

impl MakeRequestId for MakeCorrelationId {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string()).ok().map(RequestId::new)
    }
}

/// Identity of one inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationContext {
    pub correlation_id: String,
    pub trace: Option<TraceContext>,
    pub user_id: Option<String>,
}

impl CorrelationContext {
    pub fn new(correlation_id: String, trace: Option<TraceContext>) -> Self {
        Self {
            correlation_id,
            trace,
            user_id: None,
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Build from request headers, generating a correlation id if none is usable.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let correlation_id = headers
            .get(X_CORRELATION_ID)
            .and_then(usable_correlation_id)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self::new(correlation_id, trace_ctx::extract(headers))
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace.as_ref().map(|t| t.trace_id.as_str())
    }

    pub fn span_id(&self) -> Option<&str> {
        self.trace.as_ref().map(|t| t.span_id.as_str())
    }
}

impl<S> FromRequestParts<S> for CorrelationContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(ctx) = parts.extensions.get::<CorrelationContext>() {
            return Ok(ctx.clone());
        }
        Ok(CorrelationContext::from_headers(&parts.headers))
    }
}

/// Middleware: attach the request's `CorrelationContext` and echo its ids.
///
/// Runs inside `SetRequestId`. An unusable inbound id is replaced on the
/// request itself, so later layers and the response see the same value.
pub async fn correlate(mut request: Request, next: Next) -> Response {
    let ctx = CorrelationContext::from_headers(request.headers());
    let echoed = HeaderValue::from_str(&ctx.correlation_id).ok();
    if let Some(id) = &echoed {
        if request.headers().get(X_CORRELATION_ID) != Some(id) {
            request.headers_mut().insert(X_CORRELATION_ID, id.clone());
            request.extensions_mut().insert(RequestId::new(id.clone()));
        }
    }
    let trace_id = ctx.trace_id().and_then(|id| HeaderValue::from_str(id).ok());
    request.extensions_mut().insert(ctx);

    let mut response = next.run(request).await;
    if let Some(id) = echoed {
        response.headers_mut().insert(X_CORRELATION_ID, id);
    }
    if let Some(trace_id) = trace_id {
        response.headers_mut().insert(X_TRACE_ID, trace_id);
    }
    response
}
