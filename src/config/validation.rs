//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, sample rate >= 1)
//! - Validate histogram bucket layouts
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: PipelineConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::PipelineConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self { field, message: message.into() }
    }
}

fn check_buckets(field: &'static str, buckets: &[f64], errors: &mut Vec<ValidationError>) {
    if buckets.is_empty() {
        errors.push(ValidationError::new(field, "must contain at least one bucket"));
        return;
    }
    if buckets.iter().any(|b| !b.is_finite() || *b <= 0.0) {
        errors.push(ValidationError::new(field, "bounds must be positive and finite"));
    }
    if buckets.windows(2).any(|w| w[0] >= w[1]) {
        errors.push(ValidationError::new(field, "bounds must be strictly increasing"));
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &PipelineConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.service.name.trim().is_empty() {
        errors.push(ValidationError::new("service.name", "must not be empty"));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be greater than 0"));
    }
    if config.ingestion.interaction_sample_rate == 0 {
        errors.push(ValidationError::new("ingestion.interaction_sample_rate", "must be at least 1"));
    }
    if config.ingestion.max_body_bytes == 0 {
        errors.push(ValidationError::new("ingestion.max_body_bytes", "must be greater than 0"));
    }
    check_buckets("metrics.duration_buckets", &config.metrics.duration_buckets, &mut errors);
    check_buckets("metrics.size_buckets", &config.metrics.size_buckets, &mut errors);
    if config.metrics.sample_window == 0 {
        errors.push(ValidationError::new("metrics.sample_window", "must be at least 1"));
    }
    if config.metrics.max_business_events == 0 {
        errors.push(ValidationError::new("metrics.max_business_events", "must be at least 1"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
