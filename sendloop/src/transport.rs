//! Mail transport seam and the HTTP provider implementation.
//!
//! The engine only needs `send(message) -> delivery receipt`; everything
//! about the provider (SMTP, API batching, retries) lives behind this trait.
//! Exceeding the per-call timeout is a transport failure, never "unknown",
//! so one slow recipient can never wedge a batch.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("mail provider timed out after {0:?}")]
    Timeout(Duration),
    #[error("mail provider request failed: {0}")]
    Request(String),
    #[error("mail provider rejected the message: {0}")]
    Rejected(String),
}

/// One fully rendered outbound message.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html_body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_body: Option<String>,
}

/// Provider acknowledgement of an accepted message.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReceipt {
    pub provider_message_id: Option<String>,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: &OutboundEmail) -> Result<DeliveryReceipt, TransportError>;
}

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    #[serde(default)]
    message_id: Option<String>,
}

/// Transport posting JSON messages to an HTTP mail provider API.
pub struct HttpApiTransport {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpApiTransport {
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .pool_max_idle_per_host(100)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            api_key,
            timeout,
        })
    }
}

#[async_trait]
impl MailTransport for HttpApiTransport {
    async fn send(&self, message: &OutboundEmail) -> Result<DeliveryReceipt, TransportError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(message);

        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!(
                    to = %message.to,
                    timeout_seconds = self.timeout.as_secs_f64(),
                    "transport_send_timeout"
                );
                return Err(TransportError::Timeout(self.timeout));
            }
            Err(e) => {
                warn!(to = %message.to, error = %e, "transport_send_request_error");
                return Err(TransportError::Request(e.to_string()));
            }
        };

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            warn!(to = %message.to, status_code = status, "transport_send_rejected");
            return Err(TransportError::Rejected(format!("http status {status}")));
        }

        let provider_message_id = response
            .json::<ProviderResponse>()
            .await
            .ok()
            .and_then(|r| r.message_id);

        info!(
            to = %message.to,
            status_code = status,
            provider_message_id = ?provider_message_id,
            "transport_send_accepted"
        );

        Ok(DeliveryReceipt {
            provider_message_id,
        })
    }
}
