//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, middleware stack)
//!     → correlation.rs (X-Correlation-Id, trace context)
//!     → ingest.rs (POST /api/frontend-metrics → log records)
//!     → exposition.rs (/metrics, /api/metrics, /health)
//! ```

pub mod correlation;
pub mod exposition;
pub mod ingest;
pub mod server;

pub use correlation::{CorrelationContext, X_CORRELATION_ID};
pub use server::{AppState, HttpServer};
