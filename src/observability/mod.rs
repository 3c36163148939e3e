//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Every routed request:
//!     → aggregator.rs (counters, duration/size histograms, in-flight gauge)
//!     → tracing.rs (trace/span ids when a trace context is present)
//!     → logging.rs (records bound to the request's correlation id)
//!
//! Ingested frontend batches:
//!     → logging.rs (one record per entry, interactions sampled)
//!     → metrics.rs (pipeline counters via the `metrics` facade)
//!
//! Consumers:
//!     → GET /metrics (Prometheus scrape)
//!     → GET /api/metrics (JSON snapshot)
//!     → stdout (JSON or pretty logs)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Correlation id flows through all records of a request
//! - Metric updates are atomic; no lock spans unrelated label sets
//! - Tracing is optional: requests without trace headers carry none

pub mod aggregator;
pub mod logging;
pub mod metrics;
pub mod tracing;
