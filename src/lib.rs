//! Telemetry capture and correlation pipeline.
//!
//! Ingests frontend telemetry batches, joins them to server-side requests via
//! correlation ids, and aggregates request metrics into queryable snapshots.

// Core subsystems
pub mod config;
pub mod http;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::schema::PipelineConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
