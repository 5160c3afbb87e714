use camino::Utf8PathBuf;
use chrono::Utc;
use tokio::io::AsyncWriteExt;

use storage_driver::{blob_path, Driver, Fetch, Metadata, Reader, StorageError};

/// Blob storage on the local filesystem under a root directory.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
    redirect_base: Option<String>,
}

impl LocalDriver {
    /// Store blobs below `root`.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self {
            root,
            redirect_base: None,
        }
    }

    /// Answer redirect-capable fetches with a URL below `base`, which must
    /// serve the same tree as the root directory.
    pub fn with_redirect_base(mut self, base: impl Into<String>) -> Self {
        self.redirect_base = Some(base.into());
        self
    }

    fn path(&self, digest: &str) -> Result<(Utf8PathBuf, Utf8PathBuf), StorageError> {
        let relative = blob_path(self.name(), digest)?;
        Ok((self.root.join(&relative), relative))
    }

    async fn stat(&self, path: &Utf8PathBuf, digest: &str) -> Result<Metadata, StorageError> {
        let metadata = tokio::fs::metadata(path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                StorageError::not_found(self.name(), digest)
            } else {
                StorageError::io(self.name(), err)
            }
        })?;

        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map(Into::into)
            .unwrap_or_else(|_| Utc::now());

        Ok(Metadata {
            size: metadata.len(),
            created,
        })
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn metadata(&self, _repository: &str, digest: &str) -> Result<Metadata, StorageError> {
        let (path, _) = self.path(digest)?;
        self.stat(&path, digest).await
    }

    async fn get(
        &self,
        _repository: &str,
        digest: &str,
        follow_redirect: bool,
    ) -> Result<Fetch, StorageError> {
        let (path, relative) = self.path(digest)?;
        let metadata = self.stat(&path, digest).await?;

        if let (true, Some(base)) = (follow_redirect, &self.redirect_base) {
            return Ok(Fetch::Redirect {
                location: format!("{}/{relative}", base.trim_end_matches('/')),
            });
        }

        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        Ok(Fetch::Stream {
            metadata,
            reader: Box::new(tokio::io::BufReader::new(file)),
        })
    }

    async fn put(
        &self,
        _repository: &str,
        digest: &str,
        reader: &mut Reader<'_>,
    ) -> Result<Metadata, StorageError> {
        let (path, _) = self.path(digest)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::io(self.name(), err))?;
        }

        // Readers never observe a partially written blob.
        let partial = path.with_extension("partial");
        let mut writer = tokio::io::BufWriter::new(
            tokio::fs::File::create(&partial)
                .await
                .map_err(|err| StorageError::io(self.name(), err))?,
        );

        tokio::io::copy(reader, &mut writer)
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        writer
            .shutdown()
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        self.stat(&path, digest).await
    }

    async fn delete(&self, _repository: &str, digest: &str) -> Result<(), StorageError> {
        let (path, _) = self.path(digest)?;
        tokio::fs::remove_file(&path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                StorageError::not_found(self.name(), digest)
            } else {
                StorageError::io(self.name(), err)
            }
        })
    }
}
