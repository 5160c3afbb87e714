//! Rows of the registry database.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::name::is_tag_name;

/// A tenant which owns artifacts.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub slug: String,
    pub name: String,
    /// Subscription plan, which selects the pull log export cap.
    pub plan: String,
    /// Tags per artifact; `None` falls back to the service default.
    pub artifact_tag_limit: Option<i64>,
    /// Whether pushing new content under an existing tag replaces it.
    pub mutable_tags: bool,
}

/// A customer of a tenant, who receives licenses.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerOrganization {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub organization_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub email: String,
    pub name: String,
}

/// A named repository within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub organization_id: Uuid,
    pub name: String,
}

/// A tag or canonical digest row of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ArtifactVersion {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    #[sqlx(rename = "created_by_user_account_id")]
    pub created_by: Option<Uuid>,
    pub artifact_id: Uuid,
    pub name: String,
    pub manifest_digest: String,
    pub manifest_size: i64,
    pub manifest_content_type: String,
    pub manifest_data: Vec<u8>,
}

impl ArtifactVersion {
    /// Whether this row is a tag alias rather than the canonical digest row.
    pub fn is_tag(&self) -> bool {
        is_tag_name(&self.name)
    }
}

/// The identifying columns of a version, without its manifest body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, sqlx::FromRow)]
pub struct VersionRef {
    pub id: Uuid,
    pub artifact_id: Uuid,
    pub name: String,
    pub manifest_digest: String,
    pub created_at: DateTime<Utc>,
}

/// Version `artifact_version_id` references `blob_digest`.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ArtifactVersionPart {
    pub artifact_version_id: Uuid,
    pub blob_digest: String,
    pub blob_size: i64,
}

/// A license granting a customer access to artifacts.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactLicense {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub organization_id: Uuid,
    pub customer_organization_id: Uuid,
    pub name: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// One artifact (or single version, when pinned) covered by a license.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LicenseGrant {
    pub artifact_id: Uuid,
    pub artifact_version_id: Option<Uuid>,
}

impl LicenseGrant {
    /// Whether the grant covers every version of the artifact.
    pub fn is_whole_artifact(&self) -> bool {
        self.artifact_version_id.is_none()
    }
}

/// A pull log entry joined with the names needed for display and export.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactVersionPull {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub remote_address: Option<String>,
    pub artifact_id: Uuid,
    pub artifact_name: String,
    pub artifact_version_id: Option<Uuid>,
    pub version_name: String,
    pub user_account_id: Option<Uuid>,
    pub user_account_name: Option<String>,
    pub user_account_email: Option<String>,
    pub customer_organization_id: Option<Uuid>,
    pub customer_organization_name: Option<String>,
}
