//! HTTP object endpoint store
//!
//! Objects live at `{base_url}/{key}`: `PUT` uploads, `GET` downloads. An
//! optional bearer token is sent with every request. The HTTP client is
//! built on the first `configure` and reused afterwards.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{check_key, write_atomically, ArtifactStore};
use crate::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Store backed by an HTTP object endpoint
pub struct HttpArtifactStore {
    base_url: String,
    token: Option<String>,
    client: OnceCell<reqwest::Client>,
}

impl HttpArtifactStore {
    /// Create a store for `base_url` with an optional bearer token
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client: OnceCell::new(),
        }
    }

    /// URL of the object stored under `key`
    pub fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    async fn client(&self) -> Result<&reqwest::Client> {
        self.client
            .get_or_try_init(|| async {
                if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://"))
                {
                    return Err(Error::store(
                        &self.base_url,
                        "store URL must start with http:// or https://",
                    ));
                }
                reqwest::Client::builder()
                    .connect_timeout(CONNECT_TIMEOUT)
                    .timeout(REQUEST_TIMEOUT)
                    .build()
                    .map_err(|e| Error::store(&self.base_url, format!("cannot build client: {}", e)))
            })
            .await
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn configure(&self) -> Result<()> {
        self.client().await.map(|_| ())
    }

    async fn upload(&self, local: &Path, key: &str) -> Result<String> {
        check_key(key)?;
        let client = self.client().await?;
        let bytes = tokio::fs::read(local).await.map_err(|e| {
            Error::store(key, format!("cannot read {}: {}", local.display(), e))
        })?;
        let size = bytes.len();
        let url = self.object_url(key);

        let response = self
            .authorize(client.put(&url))
            .header(reqwest::header::CONTENT_TYPE, "application/gzip")
            .body(bytes)
            .send()
            .await
            .map_err(|e| Error::store(key, e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::store(
                key,
                format!("upload rejected with status {}", response.status()),
            ));
        }
        info!(key, url = %url, bytes = size, "Artifact uploaded");
        Ok(url)
    }

    async fn download(&self, local: &Path, key: &str) -> Result<()> {
        check_key(key)?;
        let client = self.client().await?;
        let url = self.object_url(key);

        let response = self
            .authorize(client.get(&url))
            .send()
            .await
            .map_err(|e| Error::store(key, e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(Error::artifact_not_found(key)),
            status if !status.is_success() => {
                return Err(Error::store(
                    key,
                    format!("download rejected with status {}", status),
                ))
            }
            _ => {}
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::store(key, e.to_string()))?;
        write_atomically(local, key, &bytes).await?;
        debug!(key, local = %local.display(), "Artifact downloaded");
        Ok(())
    }
}
