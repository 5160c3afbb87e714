use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

use storage_driver::{blob_path, Driver, Fetch, Metadata, Reader, StorageError};

#[derive(Debug, Clone)]
struct MemoryBlob {
    data: Arc<[u8]>,
    created: DateTime<Utc>,
}

impl MemoryBlob {
    fn metadata(&self) -> Metadata {
        Metadata {
            size: self.data.len() as u64,
            created: self.created,
        }
    }
}

/// In-process blob storage, mostly useful for tests and ephemeral registries.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    blobs: RwLock<HashMap<Utf8PathBuf, MemoryBlob>>,
    redirect_base: Option<String>,
}

impl MemoryDriver {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer redirect-capable fetches with `{base}/blobs/<algorithm>/<hex>`.
    pub fn with_redirect_base(mut self, base: impl Into<String>) -> Self {
        self.redirect_base = Some(base.into());
        self
    }

    async fn blob(&self, digest: &str) -> Result<(Utf8PathBuf, MemoryBlob), StorageError> {
        let path = blob_path(self.name(), digest)?;
        let blobs = self.blobs.read().await;
        let blob = blobs
            .get(&path)
            .cloned()
            .ok_or_else(|| StorageError::not_found(self.name(), digest))?;
        Ok((path, blob))
    }
}

#[async_trait::async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn metadata(&self, _repository: &str, digest: &str) -> Result<Metadata, StorageError> {
        let (_, blob) = self.blob(digest).await?;
        Ok(blob.metadata())
    }

    async fn get(
        &self,
        _repository: &str,
        digest: &str,
        follow_redirect: bool,
    ) -> Result<Fetch, StorageError> {
        let (path, blob) = self.blob(digest).await?;

        if let (true, Some(base)) = (follow_redirect, &self.redirect_base) {
            return Ok(Fetch::Redirect {
                location: format!("{}/{path}", base.trim_end_matches('/')),
            });
        }

        Ok(Fetch::Stream {
            metadata: blob.metadata(),
            reader: Box::new(Cursor::new(blob.data)),
        })
    }

    async fn put(
        &self,
        _repository: &str,
        digest: &str,
        reader: &mut Reader<'_>,
    ) -> Result<Metadata, StorageError> {
        let path = blob_path(self.name(), digest)?;

        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        let blob = MemoryBlob {
            data: buf.into(),
            created: Utc::now(),
        };
        let metadata = blob.metadata();

        let mut blobs = self.blobs.write().await;
        blobs.insert(path, blob);

        Ok(metadata)
    }

    async fn delete(&self, _repository: &str, digest: &str) -> Result<(), StorageError> {
        let path = blob_path(self.name(), digest)?;
        let mut blobs = self.blobs.write().await;
        blobs
            .remove(&path)
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found(self.name(), digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:0000000000000000000000000000000000000000000000000000000000000001";

    #[tokio::test]
    async fn put_then_get_streams_contents() {
        let driver = MemoryDriver::new();
        let mut reader: &[u8] = b"layer bytes";
        let meta = driver.put("acme/app", DIGEST, &mut reader).await.unwrap();
        assert_eq!(meta.size, 11);

        match driver.get("acme/other", DIGEST, false).await.unwrap() {
            Fetch::Stream { metadata, mut reader } => {
                assert_eq!(metadata.size, 11);
                let mut out = Vec::new();
                reader.read_to_end(&mut out).await.unwrap();
                assert_eq!(out, b"layer bytes");
            }
            other => panic!("expected a stream, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let driver = MemoryDriver::new();
        let err = driver.get("acme/app", DIGEST, false).await.unwrap_err();
        assert!(err.is_not_found());

        let err = driver.delete("acme/app", DIGEST).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn redirects_only_when_asked() {
        let driver = MemoryDriver::new().with_redirect_base("https://cdn.example.com/");
        let mut reader: &[u8] = b"x";
        driver.put("acme/app", DIGEST, &mut reader).await.unwrap();

        match driver.get("acme/app", DIGEST, true).await.unwrap() {
            Fetch::Redirect { location } => assert_eq!(
                location,
                format!(
                    "https://cdn.example.com/blobs/sha256/{}",
                    DIGEST.trim_start_matches("sha256:")
                )
            ),
            other => panic!("expected a redirect, got {other:?}"),
        }

        assert!(matches!(
            driver.get("acme/app", DIGEST, false).await.unwrap(),
            Fetch::Stream { .. }
        ));
    }
}
