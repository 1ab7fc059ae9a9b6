//! HTTP blob store client.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use quern_core::config::StorageSettings;

use crate::blob::BlobStore;
use crate::error::{Error, Result};

// Multi-gigabyte tarball uploads need far more than the CRUD timeout.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Authenticated upload client for the artifact store.
#[derive(Debug, Clone)]
pub struct HttpBlobStore {
    upload_url: String,
    download_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpBlobStore {
    /// Creates a client from storage settings.
    ///
    /// # Errors
    ///
    /// Returns a blob error if the HTTP client cannot be built.
    pub fn new(settings: &StorageSettings, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .map_err(|e| Error::Blob {
                message: "building http client".to_string(),
                source: Some(Box::new(e)),
            })?;
        Ok(Self {
            upload_url: settings.upload_url.trim_end_matches('/').to_string(),
            download_url: settings.download_url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(&self, name: &str, contents: Bytes) -> Result<String> {
        let mut builder = self
            .client
            .put(format!("{}/{name}", self.upload_url))
            .body(contents);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| Error::Blob {
            message: format!("uploading {name}"),
            source: Some(Box::new(e)),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::blob(format!("upload of {name} returned {status}")));
        }
        Ok(format!("{}/{name}", self.download_url))
    }
}
