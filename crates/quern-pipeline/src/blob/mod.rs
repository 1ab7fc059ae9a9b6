//! The blob store client.
//!
//! Artifacts (tarballs, logs, result files) are uploaded once and
//! referenced by public URL from node `artifacts` maps. Uploads are
//! content-addressed on the server side, so retrying an upload is always
//! safe.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Content-addressed artifact storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Uploads `contents` under `name` and returns the public URL.
    async fn upload(&self, name: &str, contents: Bytes) -> Result<String>;

    /// Uploads a file from the local filesystem and returns the public
    /// URL.
    async fn upload_file(&self, name: &str, path: &std::path::Path) -> Result<String> {
        let contents = tokio::fs::read(path)
            .await
            .map_err(|e| crate::error::Error::blob(format!("reading {}: {e}", path.display())))?;
        self.upload(name, Bytes::from(contents)).await
    }
}
