//! Distributed tracing support.
//!
//! # Responsibilities
//! - Extract trace context from incoming requests
//! - Create span identifiers for the server side of a request
//!
//! # Design Decisions
//! - Optional: a request without trace headers simply has no trace context
//! - Supports W3C Trace Context `traceparent`, falling back to `X-Trace-Id`

use axum::http::HeaderMap;

pub const TRACEPARENT: &str = "traceparent";
pub const X_TRACE_ID: &str = "x-trace-id";

/// Trace identifiers active for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// 32 lowercase hex characters.
    pub trace_id: String,
    /// Span id of the caller, if it sent one.
    pub parent_span_id: Option<String>,
    /// Span id assigned to this server-side span.
    pub span_id: String,
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parse a W3C `traceparent` value: `version-traceid-parentid-flags`.
///
/// All-zero trace or parent ids are rejected.
pub fn parse_traceparent(value: &str) -> Option<(String, String)> {
    let mut parts = value.trim().split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let parent_id = parts.next()?;
    let flags = parts.next()?;

    if !is_hex(version, 2) || version.eq_ignore_ascii_case("ff") || !is_hex(flags, 2) {
        return None;
    }
    if version == "00" && parts.next().is_some() {
        return None;
    }
    if !is_hex(trace_id, 32) || trace_id.bytes().all(|b| b == b'0') {
        return None;
    }
    if !is_hex(parent_id, 16) || parent_id.bytes().all(|b| b == b'0') {
        return None;
    }
    Some((trace_id.to_ascii_lowercase(), parent_id.to_ascii_lowercase()))
}

/// A random non-zero 64-bit span id as 16 hex characters.
pub fn new_span_id() -> String {
    let id = loop {
        let candidate = fastrand::u64(..);
        if candidate != 0 {
            break candidate;
        }
    };
    format!("{:016x}", id)
}

/// Extract the trace context of an inbound request, if any.
pub fn extract(headers: &HeaderMap) -> Option<TraceContext> {
    if let Some((trace_id, parent)) = headers
        .get(TRACEPARENT)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_traceparent)
    {
        return Some(TraceContext {
            trace_id,
            parent_span_id: Some(parent),
            span_id: new_span_id(),
        });
    }

    headers
        .get(X_TRACE_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(|trace_id| TraceContext {
            trace_id: trace_id.to_string(),
            parent_span_id: None,
            span_id: new_span_id(),
        })
}
