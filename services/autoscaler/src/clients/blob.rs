//! Blob/config store client.
//!
//! Fetches small opaque credentials by key: the cluster join token handed to
//! new workers and the orchestration API bearer token. Contents are never
//! interpreted, only trimmed.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::retry::RetryPolicy;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read the value stored under `key`, with surrounding whitespace removed.
    async fn read(&self, key: &str) -> Result<String>;
}

pub struct HttpBlobStore {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl HttpBlobStore {
    pub fn new(base_url: &str, retry: RetryPolicy) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        }
    }

    async fn read_once(&self, key: &str) -> Result<String> {
        let url = format!("{}/{}", self.base_url, key);
        debug!(url = %url, "Reading blob");

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to read blob '{}': {}", key, response.status());
        }

        Ok(response.text().await?.trim().to_string())
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn read(&self, key: &str) -> Result<String> {
        self.retry.run("blob read", || self.read_once(key)).await
    }
}
