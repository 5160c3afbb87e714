//! Error types for the registry

use axum::http::header::WWW_AUTHENTICATE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::name::NameError;
use crate::oci::ManifestError;
use crate::store::{Entity, StoreError};

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

const CHALLENGE: &str = r#"Basic realm="registry""#;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Malformed repository name
    #[error("invalid repository name: {0}")]
    NameInvalid(String),

    /// Repository not known to the caller
    #[error("repository name not known to registry: {0}")]
    NameUnknown(String),

    /// Manifest not found
    #[error("manifest unknown: {0}")]
    ManifestUnknown(String),

    /// Invalid manifest
    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    /// Unsupported manifest media type
    #[error("unsupported manifest type: {0}")]
    UnsupportedManifestType(String),

    /// Invalid or mismatched digest
    #[error("invalid digest: {0}")]
    DigestInvalid(String),

    /// Malformed tag
    #[error("invalid tag: {0}")]
    TagInvalid(String),

    /// Blob not found
    #[error("blob unknown to registry: {0}")]
    BlobUnknown(String),

    /// Blob upload invalid
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    /// No such upload session
    #[error("blob upload unknown to registry: {0}")]
    BlobUploadUnknown(String),

    /// Malformed `n` parameter
    #[error("invalid number of results requested: {0}")]
    PaginationNumberInvalid(String),

    /// The tag points at other content and tags are immutable
    #[error("tag {0} already exists")]
    TagAlreadyExists(String),

    /// Blocked by a reference or uniqueness guarantee
    #[error("conflict: {0}")]
    Conflict(String),

    /// The request cannot be satisfied as made
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Access denied
    #[error("requested access to the resource is denied: {0}")]
    Denied(String),

    /// Tag quota exhausted
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Missing or unknown credentials
    #[error("authentication required")]
    Unauthorized,

    /// Method not supported for the resource
    #[error("unsupported method: {0}")]
    MethodUnknown(String),

    /// Operation not supported by this registry
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Store error
    #[error("store error: {0}")]
    Store(#[source] StoreError),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[source] storage::StorageError),
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::NameUnknown(_)
            | RegistryError::ManifestUnknown(_)
            | RegistryError::BlobUnknown(_)
            | RegistryError::BlobUploadUnknown(_) => StatusCode::NOT_FOUND,
            RegistryError::NameInvalid(_)
            | RegistryError::ManifestInvalid(_)
            | RegistryError::DigestInvalid(_)
            | RegistryError::TagInvalid(_)
            | RegistryError::BlobUploadInvalid(_)
            | RegistryError::PaginationNumberInvalid(_)
            | RegistryError::BadRequest(_)
            | RegistryError::MethodUnknown(_) => StatusCode::BAD_REQUEST,
            RegistryError::UnsupportedManifestType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            RegistryError::TagAlreadyExists(_) | RegistryError::Conflict(_) => StatusCode::CONFLICT,
            RegistryError::Denied(_) | RegistryError::QuotaExceeded(_) => StatusCode::FORBIDDEN,
            RegistryError::Unauthorized => StatusCode::UNAUTHORIZED,
            RegistryError::Unsupported(_) => StatusCode::METHOD_NOT_ALLOWED,
            RegistryError::Store(_) | RegistryError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::NameInvalid(_) => "NAME_INVALID",
            RegistryError::NameUnknown(_) => "NAME_UNKNOWN",
            RegistryError::ManifestUnknown(_) => "MANIFEST_UNKNOWN",
            RegistryError::ManifestInvalid(_) | RegistryError::UnsupportedManifestType(_) => {
                "MANIFEST_INVALID"
            }
            RegistryError::DigestInvalid(_) => "DIGEST_INVALID",
            RegistryError::TagInvalid(_) => "TAG_INVALID",
            RegistryError::BlobUnknown(_) => "BLOB_UNKNOWN",
            RegistryError::BlobUploadInvalid(_) => "BLOB_UPLOAD_INVALID",
            RegistryError::BlobUploadUnknown(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::PaginationNumberInvalid(_) => "PAGINATION_NUMBER_INVALID",
            RegistryError::TagAlreadyExists(_)
            | RegistryError::BadRequest(_)
            | RegistryError::Unsupported(_) => "UNSUPPORTED",
            RegistryError::Conflict(_)
            | RegistryError::Denied(_)
            | RegistryError::QuotaExceeded(_) => "DENIED",
            RegistryError::Unauthorized => "UNAUTHORIZED",
            RegistryError::MethodUnknown(_) => "METHOD_UNKNOWN",
            RegistryError::Store(_) | RegistryError::Storage(_) => "UNKNOWN",
        }
    }

    /// Whether this is a server-side failure.
    pub fn is_internal(&self) -> bool {
        matches!(self, RegistryError::Store(_) | RegistryError::Storage(_))
    }
}

impl From<NameError> for RegistryError {
    fn from(err: NameError) -> Self {
        match err {
            NameError::Repository(name) => RegistryError::NameInvalid(name),
            NameError::Digest(digest) => RegistryError::DigestInvalid(digest),
            NameError::Tag(tag) => RegistryError::TagInvalid(tag),
        }
    }
}

impl From<ManifestError> for RegistryError {
    fn from(err: ManifestError) -> Self {
        match err {
            ManifestError::Invalid(message) => RegistryError::ManifestInvalid(message),
            ManifestError::Unsupported(media_type) => {
                RegistryError::UnsupportedManifestType(media_type)
            }
        }
    }
}

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(Entity::Version) => {
                RegistryError::ManifestUnknown(err.to_string())
            }
            StoreError::NotFound(_) => RegistryError::NameUnknown(err.to_string()),
            StoreError::Invalid(message) => RegistryError::BadRequest(message),
            StoreError::TagExists(tag) => RegistryError::TagAlreadyExists(tag),
            StoreError::Conflict(message) => RegistryError::Conflict(message),
            StoreError::QuotaExceeded { .. } => RegistryError::QuotaExceeded(err.to_string()),
            StoreError::Database(_) | StoreError::Migration(_) => RegistryError::Store(err),
        }
    }
}

impl From<storage::StorageError> for RegistryError {
    fn from(err: storage::StorageError) -> Self {
        if err.is_not_found() {
            RegistryError::BlobUnknown(err.digest().unwrap_or_default().to_owned())
        } else {
            RegistryError::Storage(err)
        }
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        let message = if self.is_internal() {
            tracing::error!(error = %self, "request failed");
            sentry::capture_error(&self);
            "internal server error".to_owned()
        } else {
            tracing::debug!(%code, error = %self, "request rejected");
            self.to_string()
        };

        let body = ErrorResponse {
            errors: vec![ErrorDetail { code, message }],
        };

        let mut response = (status, axum::Json(body)).into_response();
        if matches!(self, RegistryError::Unauthorized) {
            response
                .headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static(CHALLENGE));
        }
        response
    }
}
