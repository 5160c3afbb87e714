//! Artifact browsing for the management API.

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::api::RegistryState;
use crate::error::{RegistryError, RegistryResult};
use crate::license::Scope;
use crate::name::{Digest, Reference};
use crate::oci::ManifestKind;
use crate::principal::Principal;
use crate::store::models::Artifact;

pub(crate) fn router() -> Router<RegistryState> {
    Router::new()
        .route("/", get(list_artifacts))
        .route("/{id}", get(get_artifact).delete(delete_artifact))
}

/// One manifest of an artifact with every tag pointing at it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VersionSummary {
    digest: String,
    tags: Vec<String>,
    created_at: DateTime<Utc>,
    content_type: String,
    kind: ManifestKind,
    /// Manifest plus every distinct blob beneath it.
    size: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactDetail {
    #[serde(flatten)]
    artifact: Artifact,
    versions: Vec<VersionSummary>,
}

#[tracing::instrument(skip_all)]
async fn list_artifacts(
    State(state): State<RegistryState>,
    principal: Principal,
) -> RegistryResult<Json<Vec<Artifact>>> {
    let db = state.database();
    let scope = Scope::of(db, &principal).await?;
    let artifacts = db
        .list_artifacts(principal.organization_id)
        .await?
        .into_iter()
        .filter(|artifact| scope.covers_artifact(artifact.id))
        .collect();
    Ok(Json(artifacts))
}

#[tracing::instrument(skip(state, principal))]
async fn get_artifact(
    State(state): State<RegistryState>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> RegistryResult<Json<ArtifactDetail>> {
    let db = state.database();
    let scope = Scope::of(db, &principal).await?;
    let artifact = db.artifact_by_id(principal.organization_id, id).await?;
    if !scope.covers_artifact(artifact.id) {
        return Err(RegistryError::NameUnknown(id.to_string()));
    }

    let mut versions = Vec::new();
    for tagged in db.tagged_digests(artifact.id).await? {
        if !scope
            .covers_digest(db, artifact.organization_id, artifact.id, &tagged.digest)
            .await?
        {
            continue;
        }

        let digest = Digest::parse(&tagged.digest)?;
        let (_, version) = db
            .get_version(
                artifact.organization_id,
                &artifact.name,
                &Reference::Digest(digest),
            )
            .await?;
        let size = db.aggregate_size(&version).await?;
        versions.push(VersionSummary {
            kind: ManifestKind::infer(&version.manifest_content_type, &version.manifest_data),
            content_type: version.manifest_content_type,
            digest: tagged.digest,
            tags: tagged.tags,
            created_at: tagged.created_at,
            size,
        });
    }

    Ok(Json(ArtifactDetail { artifact, versions }))
}

#[tracing::instrument(skip(state, principal))]
async fn delete_artifact(
    State(state): State<RegistryState>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> RegistryResult<StatusCode> {
    if principal.is_customer() {
        return Err(RegistryError::Denied(
            "customers may not delete artifacts".to_owned(),
        ));
    }
    state
        .database()
        .delete_artifact(principal.organization_id, id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
