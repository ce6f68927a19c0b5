//! Update descriptors and the pluggable update source.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EngineConfig;

/// Remote identity of an available bundle. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleDescriptor {
    /// Version label, also the store address of the bundle.
    pub version: String,
    /// Download location of the payload.
    pub url: String,
    /// Expected hex SHA-256 checksum of the payload.
    pub checksum: String,
    /// Expected payload size in bytes.
    pub size: u64,
}

/// Where update descriptors come from.
///
/// Production uses [`HttpUpdateSource`]; tests use fixed implementations.
#[async_trait]
pub trait UpdateSource: Send + Sync + 'static {
    /// Latest available descriptor, or `None` when there is nothing newer.
    async fn latest(&self) -> Result<Option<BundleDescriptor>>;
}

/// Fetches the latest descriptor as JSON from a configured endpoint.
///
/// `204 No Content` means no update is available.
pub struct HttpUpdateSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpUpdateSource {
    pub fn new(endpoint: impl Into<String>, config: &EngineConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(config.user_agent.clone())
                .timeout(config.request_timeout())
                .build()
                .unwrap_or_default(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl UpdateSource for HttpUpdateSource {
    async fn latest(&self) -> Result<Option<BundleDescriptor>> {
        let resp = self
            .client
            .get(&self.endpoint)
            .header("Accept", "application/json")
            .send()
            .await
            .context("failed to query update endpoint")?;

        if resp.status() == StatusCode::NO_CONTENT {
            debug!("Update endpoint reports no update available");
            return Ok(None);
        }
        if !resp.status().is_success() {
            anyhow::bail!("update endpoint returned {}", resp.status());
        }

        let descriptor: BundleDescriptor = resp
            .json()
            .await
            .context("failed to parse update descriptor")?;
        debug!(version = %descriptor.version, "Fetched update descriptor");
        Ok(Some(descriptor))
    }
}
