//! Gatekeeping for registry requests.

use std::fmt;

use crate::error::{RegistryError, RegistryResult};
use crate::license;
use crate::name::{Digest, Reference, RepositoryName};
use crate::principal::Principal;
use crate::store::Database;
use crate::store::models::Organization;

/// What a request wants to do with a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Fetch content.
    Read,
    /// Push or delete content.
    Write,
    /// Check whether content exists.
    Stat,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Read => "read",
            Action::Write => "write",
            Action::Stat => "stat",
        })
    }
}

/// Check that `principal` may perform `action` on `repository` at all.
///
/// Repositories of other tenants are reported as unknown. Only members of
/// the tenant itself may write.
pub async fn authorize(
    db: &Database,
    principal: &Principal,
    repository: &RepositoryName,
    action: Action,
) -> RegistryResult<Organization> {
    let unknown = || RegistryError::NameUnknown(repository.to_string());

    let organization = db
        .organization_by_slug(repository.tenant())
        .await?
        .ok_or_else(unknown)?;
    if organization.id != principal.organization_id {
        return Err(unknown());
    }

    if action == Action::Write && principal.is_customer() {
        return Err(RegistryError::Denied(format!(
            "customers may not {action} {repository}"
        )));
    }

    Ok(organization)
}

/// [`authorize`], then the license check for one manifest.
pub async fn authorize_reference(
    db: &Database,
    principal: &Principal,
    repository: &RepositoryName,
    reference: &Reference,
    action: Action,
) -> RegistryResult<Organization> {
    let organization = authorize(db, principal, repository, action).await?;

    if principal.is_customer()
        && !license::authorize(db, principal, repository.artifact(), reference).await?
    {
        return Err(RegistryError::Denied(format!(
            "no license covers {repository}:{reference}"
        )));
    }

    Ok(organization)
}

/// [`authorize`] for reading, then the license check for one blob.
pub async fn authorize_blob(
    db: &Database,
    principal: &Principal,
    repository: &RepositoryName,
    digest: &Digest,
) -> RegistryResult<Organization> {
    let organization = authorize(db, principal, repository, Action::Read).await?;

    if principal.is_customer() && !license::authorize_blob(db, principal, digest).await? {
        return Err(RegistryError::Denied(format!(
            "no license covers blob {digest}"
        )));
    }

    Ok(organization)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewLicense;
    use crate::store::fixtures::{self, image, push};

    fn repo(name: &str) -> RepositoryName {
        RepositoryName::parse(name).unwrap()
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let db = Database::in_memory().await.unwrap();
        let acme = fixtures::organization(&db, "acme").await;
        let globex = fixtures::organization(&db, "globex").await;

        let vendor = fixtures::vendor(&acme);
        let org = authorize(&db, &vendor, &repo("acme/app"), Action::Write)
            .await
            .unwrap();
        assert_eq!(org.id, acme.id);

        let outsider = fixtures::vendor(&globex);
        let err = authorize(&db, &outsider, &repo("acme/app"), Action::Read)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "NAME_UNKNOWN");

        let err = authorize(&db, &vendor, &repo("initech/app"), Action::Read)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "NAME_UNKNOWN");
    }

    #[tokio::test]
    async fn customers_read_but_never_write() {
        let db = Database::in_memory().await.unwrap();
        let org = fixtures::organization(&db, "acme").await;
        let customer = fixtures::customer(&db, &org, "Initech").await;
        let principal = Principal::customer(org.id, customer.id, None);
        push(&db, &org, "app", "v1", &image(b"config", &[b"layer"])).await;

        authorize_reference(
            &db,
            &principal,
            &repo("acme/app"),
            &Reference::parse("v1").unwrap(),
            Action::Read,
        )
        .await
        .unwrap();

        let err = authorize(&db, &principal, &repo("acme/app"), Action::Write)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Denied(_)));
    }

    #[tokio::test]
    async fn unlicensed_customers_are_denied() {
        let db = Database::in_memory().await.unwrap();
        let org = fixtures::organization(&db, "acme").await;
        let initech = fixtures::customer(&db, &org, "Initech").await;
        let globex = fixtures::customer(&db, &org, "Globex").await;
        push(&db, &org, "app", "v1", &image(b"config", &[b"layer"])).await;
        let app = db.artifact(org.id, "app").await.unwrap();
        db.create_license(org.id, NewLicense::new(initech.id, "all").artifact(app.id))
            .await
            .unwrap();

        let reference = Reference::parse("v1").unwrap();
        let licensed = Principal::customer(org.id, initech.id, None);
        let other = Principal::customer(org.id, globex.id, None);

        authorize_reference(&db, &licensed, &repo("acme/app"), &reference, Action::Stat)
            .await
            .unwrap();
        let err = authorize_reference(&db, &other, &repo("acme/app"), &reference, Action::Read)
            .await
            .unwrap_err();
        assert_eq!(err.status_code().as_u16(), 403);

        let layer = Digest::sha256(b"layer");
        authorize_blob(&db, &licensed, &repo("acme/app"), &layer)
            .await
            .unwrap();
        let err = authorize_blob(&db, &other, &repo("acme/app"), &layer)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Denied(_)));
    }
}
