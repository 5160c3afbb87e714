//! Artifact licenses held by customers.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnection;
use uuid::Uuid;

use super::models::{Artifact, ArtifactLicense, ArtifactVersion, LicenseGrant};
use super::{Database, StoreError, StoreResult, now, timestamp, versions};

/// Attributes of a new license.
#[derive(Debug, Clone)]
pub struct NewLicense {
    customer_organization_id: Uuid,
    name: String,
    expires_at: Option<DateTime<Utc>>,
    grants: Vec<LicenseGrant>,
}

impl NewLicense {
    /// A license without grants which never expires.
    pub fn new(customer_organization_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            customer_organization_id,
            name: name.into(),
            expires_at: None,
            grants: Vec::new(),
        }
    }

    /// Grant every version of an artifact.
    pub fn artifact(mut self, artifact_id: Uuid) -> Self {
        self.grants.push(LicenseGrant {
            artifact_id,
            artifact_version_id: None,
        });
        self
    }

    /// Grant one version of an artifact.
    pub fn version(mut self, artifact_id: Uuid, version_id: Uuid) -> Self {
        self.grants.push(LicenseGrant {
            artifact_id,
            artifact_version_id: Some(version_id),
        });
        self
    }

    /// Stop granting access at `at`.
    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }
}

/// Refuse to delete a tag whose content a license still depends on.
///
/// Whole-artifact grants always block. A grant pinning a row with the same
/// digest blocks unless another tag keeps the digest visible.
pub(crate) async fn check_version_deletion(
    conn: &mut SqliteConnection,
    artifact: &Artifact,
    version: &ArtifactVersion,
) -> StoreResult<()> {
    let grants: Vec<LicenseGrant> = sqlx::query_as(
        "SELECT artifact_id, artifact_version_id FROM artifact_license_artifact WHERE artifact_id = ?",
    )
    .bind(artifact.id)
    .fetch_all(&mut *conn)
    .await?;

    if grants.iter().any(LicenseGrant::is_whole_artifact) {
        return Err(StoreError::Conflict(
            "cannot delete a tag of an artifact licensed as a whole".to_owned(),
        ));
    }

    let siblings = versions::with_digest(conn, artifact.id, &version.manifest_digest).await?;
    let pinned = grants.iter().any(|grant| {
        siblings
            .iter()
            .any(|sibling| grant.artifact_version_id == Some(sibling.id))
    });
    let aliased = siblings
        .iter()
        .any(|sibling| sibling.id != version.id && !sibling.name.contains(':'));

    if pinned && !aliased {
        return Err(StoreError::Conflict(
            "the manifest is licensed and this is the last tag pointing to it".to_owned(),
        ));
    }
    Ok(())
}

impl Database {
    /// Create a license with its grants.
    #[tracing::instrument(skip(self, new), fields(customer = %new.customer_organization_id))]
    pub async fn create_license(
        &self,
        organization_id: Uuid,
        new: NewLicense,
    ) -> StoreResult<ArtifactLicense> {
        let id = Uuid::new_v4();
        let mut tx = self.begin().await?;

        sqlx::query(
            "INSERT INTO artifact_license (id, created_at, organization_id, customer_organization_id, name, expires_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(now())
        .bind(organization_id)
        .bind(new.customer_organization_id)
        .bind(&new.name)
        .bind(new.expires_at.map(timestamp))
        .execute(&mut *tx)
        .await?;

        for grant in &new.grants {
            let owned: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM artifact WHERE id = ? AND organization_id = ?)",
            )
            .bind(grant.artifact_id)
            .bind(organization_id)
            .fetch_one(&mut *tx)
            .await?;
            if !owned {
                return Err(StoreError::Invalid(format!(
                    "artifact {} does not belong to the organization",
                    grant.artifact_id
                )));
            }

            sqlx::query(
                "INSERT INTO artifact_license_artifact (id, artifact_license_id, artifact_id, artifact_version_id)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4())
            .bind(id)
            .bind(grant.artifact_id)
            .bind(grant.artifact_version_id)
            .execute(&mut *tx)
            .await?;
        }

        let license = sqlx::query_as("SELECT * FROM artifact_license WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(license)
    }

    /// Whether the tenant has any license at all, which switches on enforcement.
    pub async fn has_licenses(&self, organization_id: Uuid) -> StoreResult<bool> {
        let mut conn = self.acquire().await?;
        Ok(sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM artifact_license WHERE organization_id = ?)",
        )
        .bind(organization_id)
        .fetch_one(&mut *conn)
        .await?)
    }

    /// Unexpired grants held by a customer of the tenant.
    pub async fn active_grants(
        &self,
        organization_id: Uuid,
        customer_organization_id: Uuid,
    ) -> StoreResult<Vec<LicenseGrant>> {
        let mut conn = self.acquire().await?;
        Ok(sqlx::query_as(
            "SELECT DISTINCT g.artifact_id, g.artifact_version_id
             FROM artifact_license_artifact g
             JOIN artifact_license l ON l.id = g.artifact_license_id
             WHERE l.organization_id = ? AND l.customer_organization_id = ?
               AND (l.expires_at IS NULL OR l.expires_at > ?)",
        )
        .bind(organization_id)
        .bind(customer_organization_id)
        .bind(now())
        .fetch_all(&mut *conn)
        .await?)
    }
}
