//! Pipeline-internal metrics.
//!
//! # Responsibilities
//! - Install the Prometheus recorder behind the `metrics` facade
//! - Define ingestion metrics (entries per category, malformed entries, sampling)
//! - Render recorder contents for the exposition endpoint
//!
//! # Metrics
//! - `frontend_entries_total` (counter): ingested entries by category
//! - `frontend_malformed_entries_total` (counter): skipped entries by category
//! - `frontend_interactions_logged_total` (counter): interactions that passed sampling
//! - `frontend_batch_entries` (histogram): entries per accepted batch
//! - `frontend_web_vital_value` (histogram): reported web vital values by name
//!
//! # Design Decisions
//! - Request-level metrics live in the aggregator; this module only carries
//!   counters about the pipeline's own work
//! - The recorder is process-global and installed at most once

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the global Prometheus recorder, or return the one already installed.
///
/// Returns `None` if another recorder owns the `metrics` facade.
pub fn init_metrics() -> Option<PrometheusHandle> {
    HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                tracing::info!("Prometheus recorder installed");
                Some(handle)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install Prometheus recorder");
                None
            }
        })
        .clone()
}

/// Render the installed recorder, or an empty string when none is installed.
pub fn render() -> String {
    HANDLE
        .get()
        .and_then(|h| h.as_ref())
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}

/// Count entries accepted for one category.
pub fn record_entries(category: &'static str, count: u64) {
    if count > 0 {
        metrics::counter!("frontend_entries_total", "category" => category).increment(count);
    }
}

/// Count one skipped entry.
pub fn record_malformed(category: &'static str) {
    metrics::counter!("frontend_malformed_entries_total", "category" => category).increment(1);
}

pub fn record_interactions_logged(count: u64) {
    metrics::counter!("frontend_interactions_logged_total").increment(count);
}

pub fn record_batch_size(entries: usize) {
    metrics::histogram!("frontend_batch_entries").record(entries as f64);
}

pub fn record_web_vital(name: &str, value: f64) {
    metrics::histogram!("frontend_web_vital_value", "name" => name.to_string()).record(value);
}
