//! Client-side telemetry records and the batch wire format.
//!
//! Field names serialize in camelCase because the ingestion endpoint speaks
//! the same JSON dialect as browser collectors.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header carrying the correlation id on every outbound call (`X-Correlation-Id`).
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Generate a fresh correlation id.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Kind of a recorded metric event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    WebVital,
    ApiCall,
    PageLoad,
    BusinessEvent,
    ComponentRender,
    PerformanceMeasurement,
}

/// A single recorded metric. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    #[serde(rename = "type")]
    pub kind: MetricKind,
    pub data: serde_json::Value,
    pub timestamp: i64,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub correlation_id: String,
    pub url: String,
}

/// An error observed on the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default)]
    pub context: serde_json::Value,
    pub timestamp: i64,
    pub correlation_id: String,
}

impl ErrorRecord {
    /// Build an error record stamped with the current time and a fresh correlation id.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack: None,
            context: serde_json::Value::Null,
            timestamp: now_millis(),
            correlation_id: new_correlation_id(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageView {
    pub path: String,
    pub timestamp: i64,
    pub correlation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInteraction {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
    pub timestamp: i64,
    pub correlation_id: String,
}

/// Identity of one client session.
///
/// The session id is fixed at construction; only the user id may change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    session_id: String,
    user_id: Option<String>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            session_id: format!("session_{}", Uuid::new_v4().simple()),
            user_id: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn set_user_id(&mut self, user_id: impl Into<String>) {
        self.user_id = Some(user_id.into());
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// One flush payload, as posted to the ingestion endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryBatch {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub metrics: Vec<TelemetryEvent>,
    pub errors: Vec<ErrorRecord>,
    pub page_views: Vec<PageView>,
    pub user_interactions: Vec<UserInteraction>,
    pub user_agent: String,
    pub url: String,
}

impl TelemetryBatch {
    /// Total number of entries across all four streams.
    pub fn len(&self) -> usize {
        self.metrics.len() + self.errors.len() + self.page_views.len() + self.user_interactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
