//! Error types for the version store.

use std::fmt;

/// The kind of record a lookup failed to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    /// A tenant organization.
    Organization,
    /// A customer organization of a tenant.
    CustomerOrganization,
    /// A user account.
    UserAccount,
    /// An artifact (repository).
    Artifact,
    /// A tag or digest within an artifact.
    Version,
    /// An artifact license.
    License,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Entity::Organization => "organization",
            Entity::CustomerOrganization => "customer organization",
            Entity::UserAccount => "user account",
            Entity::Artifact => "artifact",
            Entity::Version => "artifact version",
            Entity::License => "license",
        })
    }
}

/// Errors raised by store operations.
///
/// Each variant is one kind of failure a caller can act on; only
/// [`StoreError::Database`] and [`StoreError::Migration`] are internal.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested record does not exist.
    #[error("{0} not found")]
    NotFound(Entity),

    /// The request cannot be satisfied as made.
    #[error("{0}")]
    Invalid(String),

    /// The tag points at different content and tags are immutable.
    #[error("tag {0} already exists")]
    TagExists(String),

    /// The operation would violate a reference or uniqueness guarantee.
    #[error("{0}")]
    Conflict(String),

    /// The artifact is at its tag limit.
    #[error("tag limit of {limit} per artifact reached")]
    QuotaExceeded {
        /// The limit in effect.
        limit: i64,
    },

    /// Database error.
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Whether this is a storage or transport failure rather than a caller error.
    pub fn is_internal(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Migration(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_foreign_key_violation() {
                return StoreError::Conflict(
                    "the record is still referenced, e.g. by a license".to_owned(),
                );
            }
            if db.is_unique_violation() {
                return StoreError::Conflict("a record with the same name already exists".to_owned());
            }
        }
        StoreError::Database(err)
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
