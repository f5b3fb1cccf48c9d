//! Upstream origin for files missing from every local tier
//!
//! Shard nodes pull misses from the main file server's internal
//! distribution endpoint. The main node has nowhere to pull from.

use crate::error::FileError;
use crate::hash::ContentHash;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};

/// Source of files not present locally
#[async_trait]
pub trait Origin: Send + Sync {
    /// Fetch a file's bytes, `None` if the origin does not have it
    async fn fetch_remote(&self, hash: &ContentHash) -> Result<Option<Bytes>, FileError>;
}

/// Origin for the authoritative node: nothing upstream
pub struct NoOrigin;

#[async_trait]
impl Origin for NoOrigin {
    async fn fetch_remote(&self, _hash: &ContentHash) -> Result<Option<Bytes>, FileError> {
        Ok(None)
    }
}

/// Pulls from another file server's `GET /dist/{hash}`
pub struct HttpOrigin {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpOrigin {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, FileError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn file_url(&self, hash: &ContentHash) -> String {
        format!("{}/dist/{}", self.base_url, hash)
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn fetch_remote(&self, hash: &ContentHash) -> Result<Option<Bytes>, FileError> {
        let mut request = self.client.get(self.file_url(hash));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::OK => {
                let body = response.bytes().await?;
                debug!(hash = %hash, size = body.len(), "Fetched file from origin");
                Ok(Some(body))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => {
                warn!(hash = %hash, status = %status, "Origin fetch failed");
                Err(FileError::Upstream(format!("origin returned {}", status)))
            }
        }
    }
}
