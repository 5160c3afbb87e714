//! Blob storage driver interface for the artifact registry.
//!
//! Blobs are addressed by content digest. A driver either streams a blob
//! back to the registry or, when it can, hands the caller a redirect to
//! fetch the content from the backing object store directly.

mod driver;
mod error;

pub use driver::blob_path;
pub use driver::BlobReader;
pub use driver::Driver;
pub use driver::Fetch;
pub use driver::Metadata;
pub use driver::Reader;
pub use error::StorageError;
pub use error::StorageErrorKind;
