use std::{fmt, ops::Deref, sync::Arc};

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use tokio::io;

use crate::error::{StorageError, StorageErrorKind};

/// A reader stream supplying blob contents to a driver.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + Sync + 'r;

/// An owned reader stream returned by a driver for blob contents.
pub type BlobReader = Box<dyn io::AsyncRead + Unpin + Send + Sync + 'static>;

/// Blob metadata, generically provided by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the blob in bytes.
    pub size: u64,

    /// When the blob was stored.
    pub created: DateTime<Utc>,
}

/// The result of fetching a blob.
pub enum Fetch {
    /// The blob contents, streamed through the registry.
    Stream {
        /// Metadata for the blob.
        metadata: Metadata,
        /// Reader over the blob contents.
        reader: BlobReader,
    },

    /// The blob should be fetched from another location.
    Redirect {
        /// URL the client should follow.
        location: String,
    },
}

impl fmt::Debug for Fetch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fetch::Stream { metadata, .. } => f
                .debug_struct("Stream")
                .field("metadata", metadata)
                .finish_non_exhaustive(),
            Fetch::Redirect { location } => f
                .debug_struct("Redirect")
                .field("location", location)
                .finish(),
        }
    }
}

/// A blob storage driver, which stores content addressed blobs for repositories.
///
/// Blobs are keyed by digest. The repository is passed through so that
/// drivers can partition or authorize by it, but the bundled drivers share
/// blobs across repositories.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// Get the metadata for a blob.
    async fn metadata(&self, repository: &str, digest: &str) -> Result<Metadata, StorageError>;

    /// Fetch a blob.
    ///
    /// When `follow_redirect` is set, the driver may answer with
    /// [`Fetch::Redirect`] instead of streaming the contents.
    async fn get(
        &self,
        repository: &str,
        digest: &str,
        follow_redirect: bool,
    ) -> Result<Fetch, StorageError>;

    /// Store a blob, reading its contents from `reader`.
    ///
    /// The caller is responsible for verifying that the contents match the digest.
    async fn put(
        &self,
        repository: &str,
        digest: &str,
        reader: &mut Reader<'_>,
    ) -> Result<Metadata, StorageError>;

    /// Delete a blob.
    async fn delete(&self, repository: &str, digest: &str) -> Result<(), StorageError>;
}

/// Relative storage path for a blob: `blobs/<algorithm>/<encoded>`.
///
/// Rejects digests that are not `algorithm:encoded` or that would escape
/// the blob directory.
pub fn blob_path(engine: &'static str, digest: &str) -> Result<Utf8PathBuf, StorageError> {
    let invalid = || {
        StorageError::builder(
            engine,
            StorageErrorKind::InvalidRequest,
            format!("malformed digest: {digest}"),
        )
        .digest(digest)
        .build()
    };

    let (algorithm, encoded) = digest.split_once(':').ok_or_else(invalid)?;
    let safe = |part: &str| {
        !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || "+._-=".contains(c))
    };
    if !safe(algorithm) || !safe(encoded) || encoded.starts_with('.') {
        return Err(invalid());
    }

    let mut path = Utf8PathBuf::from("blobs");
    path.push(algorithm);
    path.push(encoded);
    Ok(path)
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn metadata(&self, repository: &str, digest: &str) -> Result<Metadata, StorageError> {
        self.deref().metadata(repository, digest).await
    }

    async fn get(
        &self,
        repository: &str,
        digest: &str,
        follow_redirect: bool,
    ) -> Result<Fetch, StorageError> {
        self.deref().get(repository, digest, follow_redirect).await
    }

    async fn put(
        &self,
        repository: &str,
        digest: &str,
        reader: &mut Reader<'_>,
    ) -> Result<Metadata, StorageError> {
        self.deref().put(repository, digest, reader).await
    }

    async fn delete(&self, repository: &str, digest: &str) -> Result<(), StorageError> {
        self.deref().delete(repository, digest).await
    }
}
