//! In-memory blob store for tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::blob::BlobStore;
use crate::error::Result;

/// In-memory artifact storage returning `memory://` URLs.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<BTreeMap<String, Bytes>>>,
}

impl MemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored contents for `name`. Test helper.
    pub async fn get(&self, name: &str) -> Option<Bytes> {
        self.blobs.lock().await.get(name).cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, name: &str, contents: Bytes) -> Result<String> {
        self.blobs
            .lock()
            .await
            .insert(name.to_string(), contents);
        Ok(format!("memory://{name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_returns_stable_url() {
        let store = MemoryBlobStore::new();
        let url = store
            .upload("linux-mainline.tar.gz", Bytes::from_static(b"tar"))
            .await
            .unwrap();
        assert_eq!(url, "memory://linux-mainline.tar.gz");
        assert_eq!(
            store.get("linux-mainline.tar.gz").await,
            Some(Bytes::from_static(b"tar"))
        );
    }
}
