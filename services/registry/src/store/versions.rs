//! Artifact versions: pushes, lookups, tag deletion and size aggregation.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnection;
use uuid::Uuid;

use super::models::{Artifact, ArtifactVersion, ArtifactVersionPart, Organization, VersionRef};
use super::{Database, Entity, StoreError, StoreResult, artifacts, licenses, now};
use crate::graph::Walk;
use crate::name::{Digest, Reference};
use crate::oci::{self, ManifestError, Part};
use crate::principal::Principal;

/// A manifest body ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestUpload {
    /// sha256 over the raw body.
    pub digest: Digest,
    /// Media type of the manifest.
    pub media_type: String,
    /// Length of the raw body.
    pub size: i64,
    /// The raw body, stored verbatim.
    pub data: Vec<u8>,
    /// Referenced config, layers or child manifests.
    pub parts: Vec<Part>,
}

impl ManifestUpload {
    /// Validate a pushed manifest body and extract its parts.
    pub fn parse(media_type: &str, data: Vec<u8>) -> Result<Self, ManifestError> {
        oci::reject_inline_blobs(&data)?;
        let manifest = oci::parse_manifest(media_type, &data)?;
        Ok(Self {
            digest: Digest::sha256(&data),
            media_type: manifest.media_type,
            size: data.len() as i64,
            parts: manifest.parts,
            data,
        })
    }
}

/// What a push changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// New rows were written.
    Created,
    /// An existing tag was moved to new content.
    Replaced,
    /// The reference already pointed at this content.
    Unchanged,
}

/// A manifest digest together with the tags currently aliasing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedDigest {
    pub digest: String,
    /// Sorted tag names.
    pub tags: Vec<String>,
    /// Ids of the tag rows.
    pub version_ids: Vec<Uuid>,
    /// When the oldest tag row was written.
    pub created_at: DateTime<Utc>,
}

pub(crate) async fn find_by_name(
    conn: &mut SqliteConnection,
    artifact_id: Uuid,
    name: &str,
) -> StoreResult<Option<ArtifactVersion>> {
    Ok(
        sqlx::query_as("SELECT * FROM artifact_version WHERE artifact_id = ? AND name = ?")
            .bind(artifact_id)
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

/// Resolve a reference within an artifact.
///
/// A digest resolves to its canonical row, or to any row carrying that
/// digest when the canonical row is missing.
async fn resolve(
    conn: &mut SqliteConnection,
    artifact_id: Uuid,
    reference: &Reference,
) -> StoreResult<Option<ArtifactVersion>> {
    match reference {
        Reference::Tag(tag) => find_by_name(conn, artifact_id, tag).await,
        Reference::Digest(digest) => Ok(sqlx::query_as(
            "SELECT * FROM artifact_version
             WHERE artifact_id = ? AND (name = ? OR manifest_digest = ?)
             ORDER BY name = ? DESC, created_at
             LIMIT 1",
        )
        .bind(artifact_id)
        .bind(digest.as_str())
        .bind(digest.as_str())
        .bind(digest.as_str())
        .fetch_optional(&mut *conn)
        .await?),
    }
}

pub(crate) async fn count_tags(conn: &mut SqliteConnection, artifact_id: Uuid) -> StoreResult<i64> {
    Ok(sqlx::query_scalar(
        "SELECT COUNT(*) FROM artifact_version WHERE artifact_id = ? AND instr(name, ':') = 0",
    )
    .bind(artifact_id)
    .fetch_one(&mut *conn)
    .await?)
}

async fn enforce_tag_limit(
    conn: &mut SqliteConnection,
    artifact_id: Uuid,
    limit: i64,
) -> StoreResult<()> {
    if limit <= 0 {
        return Ok(());
    }
    let tags = count_tags(conn, artifact_id).await?;
    if tags + 1 > limit {
        return Err(StoreError::QuotaExceeded { limit });
    }
    Ok(())
}

async fn insert_row(
    conn: &mut SqliteConnection,
    artifact: &Artifact,
    name: &str,
    upload: &ManifestUpload,
    principal: &Principal,
    if_absent: bool,
) -> StoreResult<Option<Uuid>> {
    let id = Uuid::new_v4();
    let conflict = if if_absent {
        "ON CONFLICT (artifact_id, name) DO NOTHING"
    } else {
        ""
    };
    let sql = format!(
        "INSERT INTO artifact_version (
            id, created_at, created_by_user_account_id, artifact_id, name,
            manifest_digest, manifest_size, manifest_content_type, manifest_data
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) {conflict}"
    );
    let result = sqlx::query(&sql)
        .bind(id)
        .bind(now())
        .bind(principal.user_account_id)
        .bind(artifact.id)
        .bind(name)
        .bind(upload.digest.as_str())
        .bind(upload.size)
        .bind(&upload.media_type)
        .bind(&upload.data)
        .execute(&mut *conn)
        .await?;

    Ok((result.rows_affected() == 1).then_some(id))
}

async fn upsert_parts(
    conn: &mut SqliteConnection,
    version_id: Uuid,
    parts: &[Part],
) -> StoreResult<()> {
    for part in parts {
        sqlx::query(
            "INSERT INTO artifact_version_part (artifact_version_id, blob_digest, blob_size)
             VALUES (?, ?, ?)
             ON CONFLICT (artifact_version_id, blob_digest)
             DO UPDATE SET blob_size = excluded.blob_size",
        )
        .bind(version_id)
        .bind(part.digest.as_str())
        .bind(part.size)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Insert the canonical digest row if no push has created it yet.
async fn insert_canonical(
    conn: &mut SqliteConnection,
    artifact: &Artifact,
    upload: &ManifestUpload,
    principal: &Principal,
) -> StoreResult<bool> {
    let created = insert_row(conn, artifact, upload.digest.as_str(), upload, principal, true)
        .await?
        .is_some();

    let canonical = find_by_name(conn, artifact.id, upload.digest.as_str())
        .await?
        .ok_or(StoreError::NotFound(Entity::Version))?;
    upsert_parts(conn, canonical.id, &upload.parts).await?;

    Ok(created)
}

async fn delete_row(conn: &mut SqliteConnection, version_id: Uuid) -> StoreResult<()> {
    let result = sqlx::query("DELETE FROM artifact_version WHERE id = ?")
        .bind(version_id)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(Entity::Version));
    }
    Ok(())
}

pub(crate) async fn with_digest(
    conn: &mut SqliteConnection,
    artifact_id: Uuid,
    digest: &str,
) -> StoreResult<Vec<VersionRef>> {
    Ok(sqlx::query_as(
        "SELECT * FROM artifact_version WHERE artifact_id = ? AND manifest_digest = ? ORDER BY name",
    )
    .bind(artifact_id)
    .bind(digest)
    .fetch_all(&mut *conn)
    .await?)
}

impl Database {
    /// Store a pushed manifest under `reference`, creating the artifact if needed.
    ///
    /// A tag push writes the tag row and the canonical digest row together;
    /// a digest push writes only the canonical row. Everything happens in
    /// one transaction.
    #[tracing::instrument(
        skip(self, org, upload, principal),
        fields(organization = %org.slug, digest = %upload.digest)
    )]
    pub async fn put_version(
        &self,
        org: &Organization,
        artifact_name: &str,
        reference: &Reference,
        upload: &ManifestUpload,
        principal: &Principal,
        default_tag_limit: i64,
    ) -> StoreResult<PushOutcome> {
        let mut tx = self.begin().await?;
        let artifact = artifacts::get_or_create(&mut tx, org.id, artifact_name).await?;

        let outcome = match reference {
            Reference::Digest(digest) => {
                if *digest != upload.digest {
                    return Err(StoreError::Invalid(format!(
                        "reference {digest} does not match manifest digest {}",
                        upload.digest
                    )));
                }
                if insert_canonical(&mut tx, &artifact, upload, principal).await? {
                    PushOutcome::Created
                } else {
                    PushOutcome::Unchanged
                }
            }
            Reference::Tag(tag) => {
                let outcome = match find_by_name(&mut tx, artifact.id, tag).await? {
                    Some(existing) if existing.manifest_digest == upload.digest.as_str() => {
                        tx.commit().await?;
                        return Ok(PushOutcome::Unchanged);
                    }
                    Some(_) if !org.mutable_tags => {
                        return Err(StoreError::TagExists(tag.clone()));
                    }
                    Some(existing) => {
                        delete_row(&mut tx, existing.id).await?;
                        PushOutcome::Replaced
                    }
                    None => {
                        let limit = org.artifact_tag_limit.unwrap_or(default_tag_limit);
                        enforce_tag_limit(&mut tx, artifact.id, limit).await?;
                        PushOutcome::Created
                    }
                };

                insert_canonical(&mut tx, &artifact, upload, principal).await?;
                let version_id = insert_row(&mut tx, &artifact, tag, upload, principal, false)
                    .await?
                    .ok_or(StoreError::NotFound(Entity::Version))?;
                upsert_parts(&mut tx, version_id, &upload.parts).await?;
                outcome
            }
        };

        tx.commit().await?;
        tracing::info!(artifact = %artifact.name, %reference, ?outcome, "stored manifest");
        Ok(outcome)
    }

    /// Resolve a tag or digest to its stored manifest.
    pub async fn get_version(
        &self,
        organization_id: Uuid,
        artifact_name: &str,
        reference: &Reference,
    ) -> StoreResult<(Artifact, ArtifactVersion)> {
        let mut conn = self.acquire().await?;
        let artifact = artifacts::find(&mut conn, organization_id, artifact_name)
            .await?
            .ok_or(StoreError::NotFound(Entity::Artifact))?;
        let version = resolve(&mut conn, artifact.id, reference)
            .await?
            .ok_or(StoreError::NotFound(Entity::Version))?;
        Ok((artifact, version))
    }

    /// Delete a tag.
    ///
    /// Digest references, the last tag of an artifact, and tags whose
    /// content a license still depends on are refused.
    #[tracing::instrument(skip(self))]
    pub async fn delete_tag(
        &self,
        organization_id: Uuid,
        artifact_name: &str,
        reference: &Reference,
    ) -> StoreResult<ArtifactVersion> {
        let Reference::Tag(tag) = reference else {
            return Err(StoreError::Invalid(
                "manifests can only be deleted by tag".to_owned(),
            ));
        };

        let mut tx = self.begin().await?;
        let artifact = artifacts::find(&mut tx, organization_id, artifact_name)
            .await?
            .ok_or(StoreError::NotFound(Entity::Artifact))?;
        let version = find_by_name(&mut tx, artifact.id, tag)
            .await?
            .ok_or(StoreError::NotFound(Entity::Version))?;

        if count_tags(&mut tx, artifact.id).await? <= 1 {
            return Err(StoreError::Conflict(
                "cannot delete the last tag of an artifact".to_owned(),
            ));
        }

        licenses::check_version_deletion(&mut tx, &artifact, &version).await?;
        delete_row(&mut tx, version.id).await?;
        tx.commit().await?;

        tracing::info!(artifact = %artifact.name, %tag, digest = %version.manifest_digest, "deleted tag");
        Ok(version)
    }

    /// Tag rows of an artifact grouped by digest, newest digest first.
    pub async fn tagged_digests(&self, artifact_id: Uuid) -> StoreResult<Vec<TaggedDigest>> {
        let mut conn = self.acquire().await?;
        let rows: Vec<VersionRef> = sqlx::query_as(
            "SELECT * FROM artifact_version
             WHERE artifact_id = ? AND instr(name, ':') = 0
             ORDER BY name",
        )
        .bind(artifact_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut grouped: BTreeMap<String, TaggedDigest> = BTreeMap::new();
        for row in rows {
            let entry = grouped
                .entry(row.manifest_digest.clone())
                .or_insert_with(|| TaggedDigest {
                    digest: row.manifest_digest.clone(),
                    tags: Vec::new(),
                    version_ids: Vec::new(),
                    created_at: row.created_at,
                });
            entry.tags.push(row.name);
            entry.version_ids.push(row.id);
            entry.created_at = entry.created_at.min(row.created_at);
        }

        let mut digests: Vec<TaggedDigest> = grouped.into_values().collect();
        digests.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.digest.cmp(&b.digest)));
        Ok(digests)
    }

    /// Every row of an artifact with the given manifest digest.
    pub async fn versions_with_digest(
        &self,
        artifact_id: Uuid,
        digest: &str,
    ) -> StoreResult<Vec<VersionRef>> {
        let mut conn = self.acquire().await?;
        with_digest(&mut conn, artifact_id, digest).await
    }

    /// Rows anywhere in the tenant carrying the given manifest digest.
    pub async fn tenant_versions_with_digest(
        &self,
        organization_id: Uuid,
        digest: &str,
    ) -> StoreResult<Vec<VersionRef>> {
        let mut conn = self.acquire().await?;
        Ok(sqlx::query_as(
            "SELECT v.* FROM artifact_version v
             JOIN artifact a ON a.id = v.artifact_id
             WHERE a.organization_id = ? AND v.manifest_digest = ?",
        )
        .bind(organization_id)
        .bind(digest)
        .fetch_all(&mut *conn)
        .await?)
    }

    /// Rows in the tenant whose manifest references `digest` as a part.
    pub async fn versions_referencing(
        &self,
        organization_id: Uuid,
        digest: &str,
    ) -> StoreResult<Vec<VersionRef>> {
        let mut conn = self.acquire().await?;
        Ok(sqlx::query_as(
            "SELECT v.* FROM artifact_version v
             JOIN artifact a ON a.id = v.artifact_id
             JOIN artifact_version_part p ON p.artifact_version_id = v.id
             WHERE a.organization_id = ? AND p.blob_digest = ?",
        )
        .bind(organization_id)
        .bind(digest)
        .fetch_all(&mut *conn)
        .await?)
    }

    /// Total stored size of a version.
    ///
    /// The manifest itself plus every blob reachable through its parts,
    /// following parts which are themselves manifests in the same artifact.
    /// Each digest counts once however many paths reach it.
    ///
    /// Nested manifests stored only under another artifact contribute their
    /// descriptor size but are not expanded; the walk never reads rows
    /// outside the version's own artifact, and so never another tenant's.
    pub async fn aggregate_size(&self, version: &ArtifactVersion) -> StoreResult<i64> {
        let mut conn = self.acquire().await?;

        let direct: Vec<ArtifactVersionPart> =
            sqlx::query_as("SELECT * FROM artifact_version_part WHERE artifact_version_id = ?")
                .bind(version.id)
                .fetch_all(&mut *conn)
                .await?;

        let mut sizes: HashMap<String, i64> = HashMap::new();
        let mut walk = Walk::new([]);
        walk.exclude(version.manifest_digest.clone());
        for part in direct {
            sizes.entry(part.blob_digest.clone()).or_insert(part.blob_size);
            walk.extend([part.blob_digest]);
        }

        while let Some(digest) = walk.next_pending() {
            let nested: Vec<(String, i64)> = sqlx::query_as(
                "SELECT DISTINCT p.blob_digest, p.blob_size
                 FROM artifact_version_part p
                 JOIN artifact_version v ON v.id = p.artifact_version_id
                 WHERE v.artifact_id = ? AND v.manifest_digest = ?",
            )
            .bind(version.artifact_id)
            .bind(&digest)
            .fetch_all(&mut *conn)
            .await?;

            for (child, size) in nested {
                sizes.entry(child.clone()).or_insert(size);
                walk.extend([child]);
            }
        }

        sizes.remove(&version.manifest_digest);
        Ok(version.manifest_size + sizes.values().sum::<i64>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewOrganization;
    use crate::store::fixtures::{self, image, index, push, vendor};

    async fn rows_with_digest(db: &Database, digest: &Digest) -> i64 {
        let mut conn = db.acquire().await.unwrap();
        sqlx::query_scalar("SELECT COUNT(*) FROM artifact_version WHERE manifest_digest = ?")
            .bind(digest.as_str())
            .fetch_one(&mut *conn)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn push_writes_tag_and_canonical_rows() {
        let db = Database::in_memory().await.unwrap();
        let org = fixtures::organization(&db, "acme").await;
        let upload = image(b"config", &[b"layer"]);

        assert_eq!(
            push(&db, &org, "app", "v1", &upload).await,
            PushOutcome::Created
        );
        assert_eq!(rows_with_digest(&db, &upload.digest).await, 2);

        let (_, by_tag) = fixtures::version(&db, &org, "app", "v1").await;
        let (_, by_digest) = fixtures::version(&db, &org, "app", upload.digest.as_str()).await;
        assert_eq!(by_tag.manifest_digest, upload.digest.as_str());
        assert_eq!(by_digest.name, upload.digest.as_str());
        assert_eq!(by_tag.manifest_data, upload.data);
        assert!(by_tag.is_tag());
        assert!(!by_digest.is_tag());
    }

    #[tokio::test]
    async fn repeated_push_is_a_no_op() {
        let db = Database::in_memory().await.unwrap();
        let org = fixtures::organization(&db, "acme").await;
        let upload = image(b"config", &[b"layer"]);

        push(&db, &org, "app", "v1", &upload).await;
        assert_eq!(
            push(&db, &org, "app", "v1", &upload).await,
            PushOutcome::Unchanged
        );
        assert_eq!(rows_with_digest(&db, &upload.digest).await, 2);
    }

    #[tokio::test]
    async fn second_tag_shares_the_canonical_row() {
        let db = Database::in_memory().await.unwrap();
        let org = fixtures::organization(&db, "acme").await;
        let upload = image(b"config", &[b"layer"]);

        push(&db, &org, "app", "v1", &upload).await;
        push(&db, &org, "app", "stable", &upload).await;
        assert_eq!(rows_with_digest(&db, &upload.digest).await, 3);

        let artifact = db.artifact(org.id, "app").await.unwrap();
        let digests = db.tagged_digests(artifact.id).await.unwrap();
        assert_eq!(digests.len(), 1);
        assert_eq!(digests[0].tags, vec!["stable", "v1"]);
    }

    #[tokio::test]
    async fn immutable_tags_reject_new_content() {
        let db = Database::in_memory().await.unwrap();
        let org = fixtures::organization(&db, "acme").await;
        let first = image(b"config", &[b"one"]);
        let second = image(b"config", &[b"two"]);

        push(&db, &org, "app", "v1", &first).await;
        let err = db
            .put_version(
                &org,
                "app",
                &Reference::Tag("v1".into()),
                &second,
                &vendor(&org),
                0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TagExists(tag) if tag == "v1"));

        let (_, stored) = fixtures::version(&db, &org, "app", "v1").await;
        assert_eq!(stored.manifest_digest, first.digest.as_str());
        assert_eq!(rows_with_digest(&db, &second.digest).await, 0);
    }

    #[tokio::test]
    async fn mutable_tags_move_to_new_content() {
        let db = Database::in_memory().await.unwrap();
        let org = db
            .create_organization(NewOrganization::new("acme").mutable_tags(true))
            .await
            .unwrap();
        let first = image(b"config", &[b"one"]);
        let second = image(b"config", &[b"two"]);

        push(&db, &org, "app", "latest", &first).await;
        assert_eq!(
            push(&db, &org, "app", "latest", &second).await,
            PushOutcome::Replaced
        );

        let (_, stored) = fixtures::version(&db, &org, "app", "latest").await;
        assert_eq!(stored.manifest_digest, second.digest.as_str());
        // The old content stays reachable by digest.
        assert_eq!(rows_with_digest(&db, &first.digest).await, 1);
    }

    #[tokio::test]
    async fn tag_limit_counts_only_new_tags() {
        let db = Database::in_memory().await.unwrap();
        let org = db
            .create_organization(NewOrganization::new("acme").tag_limit(2))
            .await
            .unwrap();
        let one = image(b"config", &[b"one"]);
        let two = image(b"config", &[b"two"]);
        let three = image(b"config", &[b"three"]);

        push(&db, &org, "app", "v1", &one).await;
        push(&db, &org, "app", "v2", &two).await;

        let err = db
            .put_version(
                &org,
                "app",
                &Reference::Tag("v3".into()),
                &three,
                &vendor(&org),
                0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded { limit: 2 }));
        assert_eq!(rows_with_digest(&db, &three.digest).await, 0);

        // Re-pushing an existing tag and pushing by digest do not consume quota.
        assert_eq!(
            push(&db, &org, "app", "v1", &one).await,
            PushOutcome::Unchanged
        );
        let outcome = db
            .put_version(
                &org,
                "app",
                &Reference::Digest(three.digest.clone()),
                &three,
                &vendor(&org),
                0,
            )
            .await
            .unwrap();
        assert_eq!(outcome, PushOutcome::Created);
        assert_eq!(rows_with_digest(&db, &three.digest).await, 1);
    }

    #[tokio::test]
    async fn default_tag_limit_applies_when_tenant_has_none() {
        let db = Database::in_memory().await.unwrap();
        let org = fixtures::organization(&db, "acme").await;
        let one = image(b"config", &[b"one"]);
        let two = image(b"config", &[b"two"]);

        push(&db, &org, "app", "v1", &one).await;
        let err = db
            .put_version(&org, "app", &Reference::Tag("v2".into()), &two, &vendor(&org), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded { limit: 1 }));
    }

    #[tokio::test]
    async fn digest_push_must_match_content() {
        let db = Database::in_memory().await.unwrap();
        let org = fixtures::organization(&db, "acme").await;
        let upload = image(b"config", &[b"layer"]);
        let other = Digest::sha256(b"something else");

        let err = db
            .put_version(
                &org,
                "app",
                &Reference::Digest(other),
                &upload,
                &vendor(&org),
                0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn missing_references() {
        let db = Database::in_memory().await.unwrap();
        let org = fixtures::organization(&db, "acme").await;

        let err = db
            .get_version(org.id, "app", &Reference::Tag("v1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(Entity::Artifact)));

        push(&db, &org, "app", "v1", &image(b"c", &[])).await;
        let err = db
            .get_version(org.id, "app", &Reference::Tag("v2".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(Entity::Version)));
    }

    #[tokio::test]
    async fn delete_tag_guards() {
        let db = Database::in_memory().await.unwrap();
        let org = fixtures::organization(&db, "acme").await;
        let upload = image(b"config", &[b"layer"]);
        push(&db, &org, "app", "v1", &upload).await;

        let err = db
            .delete_tag(org.id, "app", &Reference::Digest(upload.digest.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));

        let err = db
            .delete_tag(org.id, "app", &Reference::Tag("v1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        fixtures::version(&db, &org, "app", "v1").await;

        push(&db, &org, "app", "v2", &upload).await;
        let deleted = db
            .delete_tag(org.id, "app", &Reference::Tag("v1".into()))
            .await
            .unwrap();
        assert_eq!(deleted.name, "v1");
        // The canonical row and the other tag survive.
        assert_eq!(rows_with_digest(&db, &upload.digest).await, 2);

        let err = db
            .delete_tag(org.id, "app", &Reference::Tag("v1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(Entity::Version)));
    }

    #[tokio::test]
    async fn aggregate_size_counts_shared_blobs_once() {
        let db = Database::in_memory().await.unwrap();
        let org = fixtures::organization(&db, "acme").await;

        let base = b"shared base layer".as_slice();
        let amd64 = image(b"amd64 config", &[base, b"amd64 layer"]);
        let arm64 = image(b"arm64 config", &[base, b"arm64 layer"]);
        let multi = index(&[&amd64, &arm64]);

        push(&db, &org, "app", "amd64", &amd64).await;
        push(&db, &org, "app", "arm64", &arm64).await;
        push(&db, &org, "app", "v1", &multi).await;

        let (_, single) = fixtures::version(&db, &org, "app", "amd64").await;
        let expected_single =
            amd64.size + (b"amd64 config".len() + base.len() + b"amd64 layer".len()) as i64;
        assert_eq!(db.aggregate_size(&single).await.unwrap(), expected_single);

        let (_, top) = fixtures::version(&db, &org, "app", "v1").await;
        let expected = multi.size
            + amd64.size
            + arm64.size
            + (b"amd64 config".len()
                + b"arm64 config".len()
                + base.len()
                + b"amd64 layer".len()
                + b"arm64 layer".len()) as i64;
        assert_eq!(db.aggregate_size(&top).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn aggregate_size_stays_within_the_artifact() {
        let db = Database::in_memory().await.unwrap();
        let org = fixtures::organization(&db, "acme").await;
        let child = image(b"config", &[b"layer"]);
        let parent = index(&[&child]);
        push(&db, &org, "other", "child", &child).await;
        push(&db, &org, "app", "v1", &parent).await;

        let (_, top) = fixtures::version(&db, &org, "app", "v1").await;
        assert_eq!(db.aggregate_size(&top).await.unwrap(), parent.size + child.size);
    }

    #[tokio::test]
    async fn reverse_lookups() {
        let db = Database::in_memory().await.unwrap();
        let org = fixtures::organization(&db, "acme").await;
        let child = image(b"config", &[b"layer"]);
        let parent = index(&[&child]);
        push(&db, &org, "app", "child", &child).await;
        push(&db, &org, "app", "v1", &parent).await;

        let layer = Digest::sha256(b"layer");
        let referencing = db
            .versions_referencing(org.id, layer.as_str())
            .await
            .unwrap();
        assert!(referencing.iter().all(|v| v.manifest_digest == child.digest.as_str()));
        assert_eq!(referencing.len(), 2);

        let parents = db
            .versions_referencing(org.id, child.digest.as_str())
            .await
            .unwrap();
        assert_eq!(parents.len(), 2);
        assert!(parents.iter().all(|v| v.manifest_digest == parent.digest.as_str()));

        assert_eq!(
            db.tenant_versions_with_digest(org.id, parent.digest.as_str())
                .await
                .unwrap()
                .len(),
            2
        );
        assert!(
            db.tenant_versions_with_digest(fixtures::unknown(), parent.digest.as_str())
                .await
                .unwrap()
                .is_empty()
        );
    }
}
