use sqlx::sqlite::SqliteConnection;
use uuid::Uuid;

use super::models::Artifact;
use super::{Database, Entity, StoreError, StoreResult, now};

pub(crate) async fn find(
    conn: &mut SqliteConnection,
    organization_id: Uuid,
    name: &str,
) -> StoreResult<Option<Artifact>> {
    Ok(
        sqlx::query_as("SELECT * FROM artifact WHERE organization_id = ? AND name = ?")
            .bind(organization_id)
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

/// Insert the artifact unless it exists, then fetch it.
pub(crate) async fn get_or_create(
    conn: &mut SqliteConnection,
    organization_id: Uuid,
    name: &str,
) -> StoreResult<Artifact> {
    sqlx::query(
        "INSERT INTO artifact (id, created_at, organization_id, name) VALUES (?, ?, ?, ?)
         ON CONFLICT (organization_id, name) DO NOTHING",
    )
    .bind(Uuid::new_v4())
    .bind(now())
    .bind(organization_id)
    .bind(name)
    .execute(&mut *conn)
    .await?;

    find(conn, organization_id, name)
        .await?
        .ok_or(StoreError::NotFound(Entity::Artifact))
}

impl Database {
    /// Idempotently create an artifact.
    pub async fn get_or_create_artifact(
        &self,
        organization_id: Uuid,
        name: &str,
    ) -> StoreResult<Artifact> {
        let mut tx = self.begin().await?;
        let artifact = get_or_create(&mut tx, organization_id, name).await?;
        tx.commit().await?;
        Ok(artifact)
    }

    /// Look up an artifact by name.
    pub async fn artifact(&self, organization_id: Uuid, name: &str) -> StoreResult<Artifact> {
        let mut conn = self.acquire().await?;
        find(&mut conn, organization_id, name)
            .await?
            .ok_or(StoreError::NotFound(Entity::Artifact))
    }

    /// Look up an artifact by id within a tenant.
    pub async fn artifact_by_id(&self, organization_id: Uuid, id: Uuid) -> StoreResult<Artifact> {
        let mut conn = self.acquire().await?;
        sqlx::query_as("SELECT * FROM artifact WHERE organization_id = ? AND id = ?")
            .bind(organization_id)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(StoreError::NotFound(Entity::Artifact))
    }

    /// Every artifact of a tenant, by name.
    pub async fn list_artifacts(&self, organization_id: Uuid) -> StoreResult<Vec<Artifact>> {
        let mut conn = self.acquire().await?;
        Ok(
            sqlx::query_as("SELECT * FROM artifact WHERE organization_id = ? ORDER BY name")
                .bind(organization_id)
                .fetch_all(&mut *conn)
                .await?,
        )
    }

    /// Delete an artifact with all of its versions and pulls.
    ///
    /// Refused while any license grant names the artifact or one of its versions.
    #[tracing::instrument(skip(self))]
    pub async fn delete_artifact(&self, organization_id: Uuid, id: Uuid) -> StoreResult<()> {
        let mut tx = self.begin().await?;

        let licensed: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM artifact_license_artifact WHERE artifact_id = ?)",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        if licensed {
            return Err(StoreError::Conflict(
                "artifact is referenced by a license".to_owned(),
            ));
        }

        let result = sqlx::query("DELETE FROM artifact WHERE organization_id = ? AND id = ?")
            .bind(organization_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(Entity::Artifact));
        }

        tx.commit().await?;
        tracing::info!(artifact_id = %id, "deleted artifact");
        Ok(())
    }
}
