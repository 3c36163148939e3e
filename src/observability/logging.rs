//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the logging subsystem
//! - Bind log records to service identity and request correlation
//! - Capture error context (source chain, backtrace, request snapshot)
//!
//! # Design Decisions
//! - Uses tracing crate for output; JSON format for production, pretty for development
//! - Log level configurable via config and `RUST_LOG`
//! - Records go through a `LogSink`, so tests can capture exactly what was logged

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use axum::http::{HeaderMap, Method, Uri};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig, ServiceConfig};
use crate::http::correlation::CorrelationContext;

/// Install the global tracing subscriber.
///
/// Fails if a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true).with_current_span(true))
            .try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    }
}

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        };
        f.write_str(s)
    }
}

/// One structured log entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub level: Level,
    pub message: String,
    pub timestamp: String,
    pub service: String,
    pub version: String,
    pub environment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub fields: Map<String, Value>,
}

/// Destination of log records. Must tolerate concurrent writers.
pub trait LogSink: Send + Sync {
    fn emit(&self, record: LogRecord);
}

/// Forwards records to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

macro_rules! emit_at {
    ($macro:ident, $r:expr, $fields:expr) => {
        tracing::$macro!(
            target: "telemetry_pipeline::events",
            service = %$r.service,
            environment = %$r.environment,
            correlation_id = $r.correlation_id.as_deref(),
            trace_id = $r.trace_id.as_deref(),
            span_id = $r.span_id.as_deref(),
            user_id = $r.user_id.as_deref(),
            fields = %$fields,
            "{}",
            $r.message
        )
    };
}

impl LogSink for TracingSink {
    fn emit(&self, record: LogRecord) {
        let fields = Value::Object(record.fields.clone());
        match record.level {
            Level::Debug => emit_at!(debug, record, fields),
            Level::Info => emit_at!(info, record, fields),
            Level::Warn => emit_at!(warn, record, fields),
            Level::Error => emit_at!(error, record, fields),
        }
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Records whose message equals `message`.
    pub fn with_message(&self, message: &str) -> Vec<LogRecord> {
        self.records().into_iter().filter(|r| r.message == message).collect()
    }

    pub fn clear(&self) {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl LogSink for MemorySink {
    fn emit(&self, record: LogRecord) {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).push(record);
    }
}

/// Bounded copy of a failing request for error-path records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestSnapshot {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub body_truncated: bool,
}

const REDACTED_HEADERS: [&str; 3] = ["authorization", "cookie", "set-cookie"];

impl RequestSnapshot {
    /// Capture at most `max_body` bytes of `body`, cut on a char boundary.
    pub fn capture(method: &Method, uri: &Uri, headers: &HeaderMap, body: &[u8], max_body: usize) -> Self {
        let headers = headers
            .iter()
            .map(|(name, value)| {
                let value = if REDACTED_HEADERS.contains(&name.as_str()) {
                    "[redacted]".to_string()
                } else {
                    String::from_utf8_lossy(value.as_bytes()).into_owned()
                };
                (name.as_str().to_string(), value)
            })
            .collect();

        let text = String::from_utf8_lossy(body);
        let body_truncated = text.len() > max_body;
        let mut cut = max_body.min(text.len());
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }

        Self {
            method: method.to_string(),
            url: uri.to_string(),
            headers,
            body: text[..cut].to_string(),
            body_truncated,
        }
    }
}

/// Logger bound to service identity and, for children, a request context.
#[derive(Clone)]
pub struct ContextLogger {
    sink: Arc<dyn LogSink>,
    service: Arc<ServiceConfig>,
    correlation_id: Option<String>,
    trace_id: Option<String>,
    span_id: Option<String>,
    user_id: Option<String>,
    bound: Map<String, Value>,
}

impl ContextLogger {
    pub fn new(service: ServiceConfig, sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink,
            service: Arc::new(service),
            correlation_id: None,
            trace_id: None,
            span_id: None,
            user_id: None,
            bound: Map::new(),
        }
    }

    /// A logger bound to one request's correlation context.
    pub fn child(&self, ctx: &CorrelationContext) -> Self {
        let mut child = self.clone();
        child.correlation_id = Some(ctx.correlation_id.clone());
        child.trace_id = ctx.trace_id().map(str::to_string);
        child.span_id = ctx.span_id().map(str::to_string);
        if let Some(user_id) = &ctx.user_id {
            child.user_id = Some(user_id.clone());
        }
        child
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        if user_id.is_some() {
            self.user_id = user_id;
        }
        self
    }

    /// Bind an extra field to every record of this logger.
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.bound.insert(key.to_string(), value.into());
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn debug(&self, message: &str, fields: Value) {
        self.log(Level::Debug, message, fields);
    }

    pub fn info(&self, message: &str, fields: Value) {
        self.log(Level::Info, message, fields);
    }

    pub fn warn(&self, message: &str, fields: Value) {
        self.log(Level::Warn, message, fields);
    }

    pub fn error(&self, message: &str, fields: Value) {
        self.log(Level::Error, message, fields);
    }

    /// Log an error with its source chain, a backtrace and the failing request.
    pub fn error_with_request(
        &self,
        message: &str,
        error: &(dyn std::error::Error + 'static),
        request: Option<&RequestSnapshot>,
        fields: Value,
    ) {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(Value::String(cause.to_string()));
            source = cause.source();
        }

        let mut extra = Map::new();
        extra.insert("error_message".into(), Value::String(error.to_string()));
        extra.insert("error_chain".into(), Value::Array(chain));
        extra.insert(
            "stack".into(),
            Value::String(std::backtrace::Backtrace::capture().to_string()),
        );
        if let Some(request) = request {
            extra.insert("request".into(), serde_json::to_value(request).unwrap_or(Value::Null));
        }
        if let Value::Object(map) = fields {
            extra.extend(map);
        }
        self.log(Level::Error, message, Value::Object(extra));
    }

    fn log(&self, level: Level, message: &str, fields: Value) {
        let mut merged = self.bound.clone();
        match fields {
            Value::Object(map) => merged.extend(map),
            Value::Null => {}
            other => {
                merged.insert("value".into(), other);
            }
        }

        self.sink.emit(LogRecord {
            level,
            message: message.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            service: self.service.name.clone(),
            version: self.service.version.clone(),
            environment: self.service.environment.clone(),
            correlation_id: self.correlation_id.clone(),
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
            user_id: self.user_id.clone(),
            fields: merged,
        });
    }
}
