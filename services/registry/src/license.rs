//! License enforcement.
//!
//! A tenant without any license is open to all of its customers. Once it
//! issues one, a customer may only read content covered by an unexpired
//! grant: every version of a licensed artifact, or a licensed version
//! together with everything beneath it in the reference graph. A manifest
//! is covered when any row sharing its digest in the same artifact, or any
//! manifest which transitively references it, is granted.

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::graph::Walk;
use crate::name::{Digest, Reference};
use crate::principal::Principal;
use crate::store::models::{LicenseGrant, VersionRef};
use crate::store::{Database, StoreResult};

/// What a principal may read within its tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Licensing does not apply.
    Unrestricted,
    /// Only content covered by these grants.
    Licensed(Vec<LicenseGrant>),
}

impl Scope {
    /// The scope of `principal`.
    pub async fn of(db: &Database, principal: &Principal) -> StoreResult<Self> {
        let Some(customer) = principal.customer_organization_id else {
            return Ok(Scope::Unrestricted);
        };
        if !db.has_licenses(principal.organization_id).await? {
            return Ok(Scope::Unrestricted);
        }
        let grants = db
            .active_grants(principal.organization_id, customer)
            .await?;
        Ok(Scope::Licensed(grants))
    }

    /// Whether any grant names the artifact at all.
    pub fn covers_artifact(&self, artifact_id: Uuid) -> bool {
        match self {
            Scope::Unrestricted => true,
            Scope::Licensed(grants) => grants.iter().any(|g| g.artifact_id == artifact_id),
        }
    }

    /// Whether a manifest digest within an artifact is readable.
    pub async fn covers_digest(
        &self,
        db: &Database,
        organization_id: Uuid,
        artifact_id: Uuid,
        digest: &str,
    ) -> StoreResult<bool> {
        let grants = match self {
            Scope::Unrestricted => return Ok(true),
            Scope::Licensed(grants) if grants.is_empty() => return Ok(false),
            Scope::Licensed(grants) => grants,
        };

        let start = db.versions_with_digest(artifact_id, digest).await?;
        let rows = ancestors(db, organization_id, start).await?;
        Ok(granted(grants, &rows))
    }

    /// Whether a blob is readable through any manifest referencing it.
    pub async fn covers_blob(
        &self,
        db: &Database,
        organization_id: Uuid,
        digest: &Digest,
    ) -> StoreResult<bool> {
        let grants = match self {
            Scope::Unrestricted => return Ok(true),
            Scope::Licensed(grants) if grants.is_empty() => return Ok(false),
            Scope::Licensed(grants) => grants,
        };

        let start = db
            .versions_referencing(organization_id, digest.as_str())
            .await?;
        let rows = ancestors(db, organization_id, start).await?;
        Ok(granted(grants, &rows))
    }
}

/// `start` plus every row which transitively references one of their digests.
async fn ancestors(
    db: &Database,
    organization_id: Uuid,
    start: Vec<VersionRef>,
) -> StoreResult<BTreeSet<VersionRef>> {
    let mut walk = Walk::new(start.iter().map(|row| row.manifest_digest.clone()));
    let mut rows: BTreeSet<VersionRef> = start.into_iter().collect();

    while let Some(digest) = walk.next_pending() {
        let parents = db.versions_referencing(organization_id, &digest).await?;
        walk.extend(parents.iter().map(|row| row.manifest_digest.clone()));
        rows.extend(parents);
    }

    Ok(rows)
}

fn granted(grants: &[LicenseGrant], rows: &BTreeSet<VersionRef>) -> bool {
    rows.iter().any(|row| {
        grants.iter().any(|grant| {
            grant.artifact_id == row.artifact_id
                && grant.artifact_version_id.is_none_or(|id| id == row.id)
        })
    })
}

/// Whether `principal` may read `reference` in one of its tenant's artifacts.
#[tracing::instrument(skip(db, principal), fields(customer = ?principal.customer_organization_id))]
pub async fn authorize(
    db: &Database,
    principal: &Principal,
    artifact_name: &str,
    reference: &Reference,
) -> StoreResult<bool> {
    let scope = Scope::of(db, principal).await?;
    if scope == Scope::Unrestricted {
        return Ok(true);
    }

    let (artifact, version) = db
        .get_version(principal.organization_id, artifact_name, reference)
        .await?;
    scope
        .covers_digest(
            db,
            principal.organization_id,
            artifact.id,
            &version.manifest_digest,
        )
        .await
}

/// Whether `principal` may read a blob of its tenant.
#[tracing::instrument(skip(db, principal), fields(customer = ?principal.customer_organization_id))]
pub async fn authorize_blob(
    db: &Database,
    principal: &Principal,
    digest: &Digest,
) -> StoreResult<bool> {
    Scope::of(db, principal)
        .await?
        .covers_blob(db, principal.organization_id, digest)
        .await
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::store::NewLicense;
    use crate::store::fixtures::{self, image, index, push};
    use crate::store::models::Organization;

    struct Tenant {
        db: Database,
        org: Organization,
        licensed: Principal,
        other: Principal,
    }

    async fn tenant() -> Tenant {
        let db = Database::in_memory().await.unwrap();
        let org = fixtures::organization(&db, "acme").await;
        let initech = fixtures::customer(&db, &org, "Initech").await;
        let globex = fixtures::customer(&db, &org, "Globex").await;
        Tenant {
            licensed: Principal::customer(org.id, initech.id, None),
            other: Principal::customer(org.id, globex.id, None),
            db,
            org,
        }
    }

    async fn can_read(t: &Tenant, principal: &Principal, artifact: &str, reference: &str) -> bool {
        authorize(&t.db, principal, artifact, &Reference::parse(reference).unwrap())
            .await
            .unwrap()
    }

    async fn license_version(t: &Tenant, artifact: &str, reference: &str) {
        let (artifact, version) = fixtures::version(&t.db, &t.org, artifact, reference).await;
        t.db.create_license(
            t.org.id,
            NewLicense::new(t.licensed.customer_organization_id.unwrap(), "pinned")
                .version(artifact.id, version.id),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn open_access_without_licenses() {
        let t = tenant().await;
        push(&t.db, &t.org, "app", "v1", &image(b"config", &[b"layer"])).await;

        assert!(can_read(&t, &t.licensed, "app", "v1").await);
        assert!(can_read(&t, &t.other, "app", "v1").await);
        assert!(
            authorize_blob(&t.db, &t.other, &Digest::sha256(b"layer"))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn version_license_covers_its_digest_aliases() {
        let t = tenant().await;
        let licensed = image(b"config", &[b"one"]);
        push(&t.db, &t.org, "app", "v1", &licensed).await;
        push(&t.db, &t.org, "app", "stable", &licensed).await;
        push(&t.db, &t.org, "app", "v2", &image(b"config", &[b"two"])).await;
        license_version(&t, "app", licensed.digest.as_str()).await;

        assert!(can_read(&t, &t.licensed, "app", "v1").await);
        assert!(can_read(&t, &t.licensed, "app", "stable").await);
        assert!(can_read(&t, &t.licensed, "app", licensed.digest.as_str()).await);
        assert!(!can_read(&t, &t.licensed, "app", "v2").await);

        assert!(!can_read(&t, &t.other, "app", "v1").await);
        assert!(!can_read(&t, &t.other, "app", "v2").await);

        // Vendors are never gated.
        let vendor = fixtures::vendor(&t.org);
        assert!(can_read(&t, &vendor, "app", "v2").await);
    }

    #[tokio::test]
    async fn whole_artifact_license() {
        let t = tenant().await;
        push(&t.db, &t.org, "app", "v1", &image(b"config", &[b"one"])).await;
        push(&t.db, &t.org, "app", "v2", &image(b"config", &[b"two"])).await;
        push(&t.db, &t.org, "tool", "v1", &image(b"tool", &[])).await;
        let app = t.db.artifact(t.org.id, "app").await.unwrap();
        t.db.create_license(
            t.org.id,
            NewLicense::new(t.licensed.customer_organization_id.unwrap(), "all").artifact(app.id),
        )
        .await
        .unwrap();

        assert!(can_read(&t, &t.licensed, "app", "v1").await);
        assert!(can_read(&t, &t.licensed, "app", "v2").await);
        assert!(!can_read(&t, &t.licensed, "tool", "v1").await);

        let scope = Scope::of(&t.db, &t.licensed).await.unwrap();
        let tool = t.db.artifact(t.org.id, "tool").await.unwrap();
        assert!(scope.covers_artifact(app.id));
        assert!(!scope.covers_artifact(tool.id));
    }

    #[tokio::test]
    async fn index_license_covers_children_and_blobs() {
        let t = tenant().await;
        let amd64 = image(b"amd64 config", &[b"amd64 layer"]);
        let arm64 = image(b"arm64 config", &[b"arm64 layer"]);
        let multi = index(&[&amd64, &arm64]);
        let unrelated = image(b"config", &[b"unrelated layer"]);
        push(&t.db, &t.org, "app", "amd64", &amd64).await;
        push(&t.db, &t.org, "app", "arm64", &arm64).await;
        push(&t.db, &t.org, "app", "v1", &multi).await;
        push(&t.db, &t.org, "app", "other", &unrelated).await;
        license_version(&t, "app", multi.digest.as_str()).await;

        assert!(can_read(&t, &t.licensed, "app", "v1").await);
        assert!(can_read(&t, &t.licensed, "app", amd64.digest.as_str()).await);
        assert!(can_read(&t, &t.licensed, "app", "arm64").await);
        assert!(!can_read(&t, &t.licensed, "app", "other").await);

        assert!(can_read_blob(&t, b"amd64 layer").await);
        assert!(can_read_blob(&t, b"arm64 config").await);
        assert!(!can_read_blob(&t, b"unrelated layer").await);
        assert!(!can_read_blob(&t, b"never pushed").await);
    }

    async fn can_read_blob(t: &Tenant, data: &[u8]) -> bool {
        authorize_blob(&t.db, &t.licensed, &Digest::sha256(data))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn expired_licenses_grant_nothing() {
        let t = tenant().await;
        push(&t.db, &t.org, "app", "v1", &image(b"config", &[b"one"])).await;
        let app = t.db.artifact(t.org.id, "app").await.unwrap();
        t.db.create_license(
            t.org.id,
            NewLicense::new(t.licensed.customer_organization_id.unwrap(), "lapsed")
                .artifact(app.id)
                .expires_at(Utc::now() - Duration::minutes(5)),
        )
        .await
        .unwrap();

        assert!(!can_read(&t, &t.licensed, "app", "v1").await);
        assert_eq!(
            Scope::of(&t.db, &t.licensed).await.unwrap(),
            Scope::Licensed(Vec::new())
        );
    }
}
