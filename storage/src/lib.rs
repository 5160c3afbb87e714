//! # Blob storage backends
//!
//! Configuration and unification for the registry's blob storage drivers.

use std::sync::Arc;

#[cfg(feature = "local")]
use camino::Utf8PathBuf;
use serde::Deserialize;
use tokio::io;

#[cfg(feature = "local")]
pub(crate) mod local;

pub(crate) mod memory;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryDriver;

#[doc(inline)]
pub use storage_driver::{Driver, Fetch, Metadata, StorageError, StorageErrorKind};

/// Storage backend selection, as read from the service configuration.
///
/// ```toml
/// [storage.local]
/// path = "/var/lib/registry"
/// redirect-base = "https://cdn.example.com/registry"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum StorageConfig {
    /// Keep blobs in process memory.
    Memory,

    /// Keep blobs on the local filesystem.
    #[cfg(feature = "local")]
    Local {
        /// Root directory for blobs.
        path: Utf8PathBuf,

        /// Public URL mirroring `path`; when set, blob fetches redirect there.
        #[serde(default)]
        redirect_base: Option<String>,
    },
}

impl StorageConfig {
    /// Construct the configured storage backend.
    #[tracing::instrument]
    pub async fn build(self) -> Result<Storage, StorageError> {
        let client: Storage = match self {
            StorageConfig::Memory => MemoryDriver::new().into(),
            #[cfg(feature = "local")]
            StorageConfig::Local {
                path,
                redirect_base,
            } => {
                tokio::fs::create_dir_all(&path)
                    .await
                    .map_err(|err| StorageError::io("local", err))?;
                let mut driver = LocalDriver::new(path);
                if let Some(base) = redirect_base {
                    driver = driver.with_redirect_base(base);
                }
                driver.into()
            }
        };
        Ok(client)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A cloneable handle to a blob storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// Name of the underlying driver.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// Metadata for a blob.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn metadata(&self, repository: &str, digest: &str) -> Result<Metadata, StorageError> {
        self.driver.metadata(repository, digest).await
    }

    /// Fetch a blob, streaming or redirecting.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn get(
        &self,
        repository: &str,
        digest: &str,
        follow_redirect: bool,
    ) -> Result<Fetch, StorageError> {
        tracing::trace!(%repository, %digest, "fetching blob");
        self.driver.get(repository, digest, follow_redirect).await
    }

    /// Store a blob from a reader.
    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name()))]
    pub async fn put<'d, R>(
        &'d self,
        repository: &str,
        digest: &str,
        reader: &mut R,
    ) -> Result<Metadata, StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%repository, %digest, "storing blob");
        self.driver.put(repository, digest, reader).await
    }

    /// Delete a blob.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn delete(&self, repository: &str, digest: &str) -> Result<(), StorageError> {
        self.driver.delete(repository, digest).await
    }
}
