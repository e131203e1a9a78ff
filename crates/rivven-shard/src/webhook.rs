//! HTTP webhook callbacks
//!
//! Operators supply three webhooks: one that acquires the external write lock
//! around the source database, one that releases it, and an optional error
//! callback notified when a migration aborts.
//!
//! The lock webhook carries a strict contract: it must not answer with a
//! success status until every in-flight source transaction has completed and
//! no further writes can happen until the unlock webhook is called. The
//! orchestrator performs no write quiescing of its own.
//!
//! # Example
//!
//! ```yaml
//! cutover_lock:
//!   uri: https://ops.internal/shards/42/lock
//!   payload: shard-42
//!   timeout_secs: 30
//! ```

use crate::error::{Result, ShardError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// A webhook posted with a JSON body `{"Payload": <payload>}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpCallback {
    /// Target URI
    pub uri: String,

    /// Opaque payload forwarded to the endpoint
    #[serde(default)]
    pub payload: String,

    /// Per-request timeout in seconds (none = client default)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl HttpCallback {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Check that the URI is a well-formed http(s) URL.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.uri.trim().is_empty() {
            return Err(ShardError::validation(format!("{} uri is required", name)));
        }

        let url = reqwest::Url::parse(&self.uri).map_err(|e| {
            ShardError::validation(format!("{} uri '{}' is invalid: {}", name, self.uri, e))
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ShardError::validation(format!(
                "{} uri '{}' must use http or https",
                name, self.uri
            )));
        }

        if self.timeout_secs == Some(0) {
            return Err(ShardError::validation(format!(
                "{} timeout_secs must be greater than 0",
                name
            )));
        }

        Ok(())
    }

    /// Post `{"Payload": payload}` to the endpoint.
    pub async fn post(&self, client: &reqwest::Client) -> Result<()> {
        let body = serde_json::json!({ "Payload": self.payload });
        self.post_json(client, &body).await
    }

    /// Post an arbitrary JSON body; any non-2xx status is an error.
    pub async fn post_json(&self, client: &reqwest::Client, body: &serde_json::Value) -> Result<()> {
        let mut request = client.post(&self.uri).json(body);
        if let Some(secs) = self.timeout_secs {
            request = request.timeout(Duration::from_secs(secs));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ShardError::Webhook {
                uri: self.uri.clone(),
                status: status.as_u16(),
            });
        }

        debug!(uri = %self.uri, status = %status, "webhook accepted");
        Ok(())
    }
}

/// Client side of the external write lock.
///
/// The orchestrator calls one instance to lock and another to unlock, sharing
/// a single HTTP client for the whole run.
#[async_trait]
pub trait LockClient: Send + Sync {
    async fn post(&self, client: &reqwest::Client) -> Result<()>;
}

#[async_trait]
impl LockClient for HttpCallback {
    async fn post(&self, client: &reqwest::Client) -> Result<()> {
        HttpCallback::post(self, client).await
    }
}
