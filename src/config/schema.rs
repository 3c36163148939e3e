//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the pipeline.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the telemetry pipeline.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Service identity stamped on every log record.
    pub service: ServiceConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Frontend batch ingestion settings.
    pub ingestion: IngestionConfig,

    /// Request metrics aggregation settings.
    pub metrics: MetricsConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:3001").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3001".to_string(),
        }
    }
}

/// Service identity.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub version: String,
    /// Deployment environment (development, staging, production).
    pub environment: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "telemetry-pipeline".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

/// Ingestion endpoint configuration. Reloadable at runtime.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct IngestionConfig {
    /// Log one in every N user interactions of a batch.
    pub interaction_sample_rate: u32,

    /// Maximum accepted batch body size in bytes.
    pub max_body_bytes: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            interaction_sample_rate: 10,
            max_body_bytes: 1024 * 1024, // 1MB
        }
    }
}

/// Request metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Upper bounds of the request duration histogram, in seconds.
    pub duration_buckets: Vec<f64>,

    /// Upper bounds of the request/response size histograms, in bytes.
    pub size_buckets: Vec<f64>,

    /// Number of recent duration samples kept for percentile queries.
    pub sample_window: usize,

    /// Distinct business counter names tracked before new names fold into `other`.
    pub max_business_events: usize,

    /// Install the Prometheus recorder for pipeline-internal counters.
    pub prometheus_enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            duration_buckets: vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0],
            size_buckets: vec![100.0, 1_000.0, 10_000.0, 100_000.0, 1_000_000.0],
            sample_window: 1000,
            max_business_events: 100,
            prometheus_enabled: true,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,

    pub format: LogFormat,

    /// Maximum request body bytes captured in error-path log records.
    pub max_body_snapshot: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "telemetry_pipeline=info,tower_http=info".to_string(),
            format: LogFormat::Json,
            max_body_snapshot: 1024,
        }
    }
}
