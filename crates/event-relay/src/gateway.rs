//! HTTP client for the downstream gateway.
//!
//! Posts `{ "query": ... }` documents and classifies the result so the
//! delivery handler can decide between ack, requeue and dead-letter.

use crate::config::GatewayConfig;
use crate::mutation::MutationRequest;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Largest response body kept in an error, in bytes.
const MAX_ERROR_BODY: usize = 1024;

/// Gateway error type.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// The HTTP client could not be built
    #[error("Gateway client configuration error: {0}")]
    Configuration(String),

    /// No response was received
    #[error("Gateway transport error: {0}")]
    Transport(String),

    /// The request did not complete within the configured timeout
    #[error("Gateway timed out after {0:?}")]
    Timeout(Duration),

    /// A response with a non-2xx status
    #[error("Gateway returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// A 2xx response whose body is not the expected JSON
    #[error("Gateway returned HTTP {status} with unreadable body: {reason}")]
    InvalidResponse { status: u16, reason: String },
}

impl GatewayError {
    /// Whether a later attempt of the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Transport(_) | GatewayError::Timeout(_) => true,
            GatewayError::Status { status, .. } => *status >= 500 || *status == 429,
            GatewayError::Configuration(_) | GatewayError::InvalidResponse { .. } => false,
        }
    }
}

/// A parsed 2xx gateway response.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct GatewayResponse {
    #[serde(skip)]
    pub status: u16,

    #[serde(default)]
    pub data: Option<Value>,

    /// Top-level `errors` reported by the gateway
    #[serde(default)]
    pub errors: Option<Value>,
}

impl GatewayResponse {
    pub fn has_errors(&self) -> bool {
        match &self.errors {
            None | Some(Value::Null) => false,
            Some(Value::Array(items)) => !items.is_empty(),
            Some(_) => true,
        }
    }
}

/// Sends mutation requests downstream.
#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    async fn send(&self, request: &MutationRequest) -> Result<GatewayResponse, GatewayError>;
}

/// [`Gateway`] over HTTP using reqwest.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpGateway {
    /// Create a gateway client with the configured timeout and user agent.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| GatewayError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    async fn post(&self, request: &MutationRequest) -> Result<GatewayResponse, GatewayError> {
        let response = self
            .client
            .post(&self.config.url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(self.config.timeout)
                } else if e.is_connect() {
                    GatewayError::Transport(format!("connection failed: {e}"))
                } else {
                    GatewayError::Transport(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(self.config.timeout)
            } else {
                GatewayError::Transport(format!("failed to read response body: {e}"))
            }
        })?;

        if !(200..300).contains(&status) {
            return Err(GatewayError::Status {
                status,
                body: truncated(&bytes),
            });
        }

        let mut parsed: GatewayResponse =
            serde_json::from_slice(&bytes).map_err(|e| GatewayError::InvalidResponse {
                status,
                reason: e.to_string(),
            })?;
        parsed.status = status;
        Ok(parsed)
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn send(&self, request: &MutationRequest) -> Result<GatewayResponse, GatewayError> {
        let start = Instant::now();
        debug!(url = %self.config.url, "Sending mutation to gateway");

        let result = self.post(request).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(response) if response.has_errors() => {
                warn!(
                    status = response.status,
                    duration_ms,
                    errors = %response.errors.clone().unwrap_or_default(),
                    "Gateway reported errors for mutation"
                );
            }
            Ok(response) => {
                info!(status = response.status, duration_ms, "Gateway accepted mutation");
            }
            Err(GatewayError::Status { status, body }) => {
                warn!(status, duration_ms, body = %body, "Gateway returned non-success status");
            }
            Err(e) => {
                error!(duration_ms, error = %e, "Gateway request failed");
            }
        }

        result
    }
}

fn truncated(bytes: &[u8]) -> String {
    if bytes.len() > MAX_ERROR_BODY {
        let text = String::from_utf8_lossy(&bytes[..MAX_ERROR_BODY]);
        format!("{text}... (truncated)")
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}
