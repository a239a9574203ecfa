//! Transport boundary: how a batch leaves the process.

use async_trait::async_trait;
use beacon_core::envelope::EventEnvelope;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Errors emitted by a transport. Every variant is retried on the next flush.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Request could not be sent or timed out.
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    /// Endpoint answered with a non-2xx status.
    #[error("ingest endpoint returned status {0}")]
    Status(u16),
    /// Refused by a non-HTTP transport.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Sends one batch. Resolves `Ok` only when the batch was accepted downstream.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_batch(&self, events: &[EventEnvelope]) -> Result<(), TransportError>;
}

#[derive(Serialize)]
struct BatchBody<'a> {
    events: &'a [EventEnvelope],
}

/// JSON-over-HTTP transport: `POST <endpoint>` with body `{"events": [...]}`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    /// Build a client with a per-request `timeout`.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint: endpoint.into() })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_batch(&self, events: &[EventEnvelope]) -> Result<(), TransportError> {
        let resp = self.client.post(&self.endpoint).json(&BatchBody { events }).send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status(status.as_u16()))
        }
    }
}
