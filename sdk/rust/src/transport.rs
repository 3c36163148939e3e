//! Delivery of flush payloads to the ingestion endpoint.

use async_trait::async_trait;
use reqwest::Client;

use crate::event::TelemetryBatch;

/// Error raised when a batch could not be delivered.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("ingestion endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("no async runtime available for beacon dispatch")]
    NoRuntime,
}

/// Sends telemetry batches somewhere.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a batch and wait for acknowledgement.
    async fn send(&self, batch: &TelemetryBatch) -> Result<(), TransportError>;

    /// Fire-and-forget delivery for when the host is going away.
    ///
    /// Returns once the payload has been handed off, without waiting for the
    /// server.
    fn send_beacon(&self, batch: TelemetryBatch) -> Result<(), TransportError>;
}

/// HTTP transport posting JSON to the ingestion endpoint.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
}

impl HttpTransport {
    /// `base_url` is the server root, e.g. `http://localhost:3001`.
    pub fn new(base_url: &str) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/api/frontend-metrics", base_url.trim_end_matches('/')),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, batch: &TelemetryBatch) -> Result<(), TransportError> {
        let resp = self.client
            .post(&self.endpoint)
            .json(batch)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status { status: status.as_u16(), body });
        }
        Ok(())
    }

    fn send_beacon(&self, batch: TelemetryBatch) -> Result<(), TransportError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let request = self.client.post(&self.endpoint).json(&batch);
        handle.spawn(async move {
            if let Err(e) = request.send().await {
                tracing::debug!(error = %e, "Beacon delivery failed");
            }
        });
        Ok(())
    }
}
