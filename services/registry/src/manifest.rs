//! Manifest operations for the registry

use axum::Json;
use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, LINK, LOCATION};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::api::RegistryState;
use crate::audit;
use crate::authz::{self, Action};
use crate::error::{RegistryError, RegistryResult};
use crate::license::{self, Scope};
use crate::name::{Digest, Reference, RepositoryName};
use crate::oci::{self, Descriptor};
use crate::principal::Principal;
use crate::store::{Entity, ManifestUpload, PushOutcome, StoreError};

pub(crate) const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");
const OCI_SUBJECT: HeaderName = HeaderName::from_static("oci-subject");
const OCI_FILTERS_APPLIED: HeaderName = HeaderName::from_static("oci-filters-applied");

/// Largest manifest body accepted on push.
const MAX_MANIFEST_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Default, Deserialize)]
struct Pagination {
    n: Option<String>,
    last: Option<String>,
}

impl Pagination {
    fn parse(query: &str) -> RegistryResult<Self> {
        serde_urlencoded::from_str(query).map_err(|err| RegistryError::BadRequest(err.to_string()))
    }

    fn limit(&self, default: usize) -> RegistryResult<usize> {
        match self.n.as_deref() {
            None | Some("") => Ok(default),
            Some(n) => n
                .parse()
                .map_err(|_| RegistryError::PaginationNumberInvalid(n.to_owned())),
        }
    }
}

/// One page of sorted `items` after `last`, and whether more remain.
fn paginate(mut items: Vec<String>, last: Option<&str>, limit: usize) -> (Vec<String>, bool) {
    items.sort();
    items.dedup();
    if let Some(last) = last {
        items.retain(|item| item.as_str() > last);
    }
    let truncated = items.len() > limit;
    items.truncate(limit);
    (items, truncated)
}

fn next_link(path: &str, page: &[String], limit: usize) -> Option<String> {
    page.last()
        .map(|last| format!("<{path}?n={limit}&last={last}>; rel=\"next\""))
}

fn listing<T: Serialize>(body: T, link: Option<String>) -> Response {
    let mut response = Json(body).into_response();
    if let Some(link) = link.and_then(|link| link.parse().ok()) {
        response.headers_mut().insert(LINK, link);
    }
    response
}

/// Fetch (or, with `head`, stat) a manifest.
#[tracing::instrument(skip(state, principal), fields(operation = "get_manifest"))]
pub(crate) async fn get(
    state: &RegistryState,
    principal: &Principal,
    repository: &str,
    reference: &str,
    head: bool,
) -> RegistryResult<Response> {
    let repository = RepositoryName::parse(repository)?;
    let reference = Reference::parse(reference)?;
    let action = if head { Action::Stat } else { Action::Read };

    let db = state.database();
    let organization =
        authz::authorize_reference(db, principal, &repository, &reference, action).await?;
    let (_, version) = db
        .get_version(organization.id, repository.artifact(), &reference)
        .await?;

    audit::record_pull(state, &version, principal).await;

    let headers = [
        (CONTENT_TYPE, version.manifest_content_type.clone()),
        (DOCKER_CONTENT_DIGEST, version.manifest_digest.clone()),
        (CONTENT_LENGTH, version.manifest_size.to_string()),
    ];
    if head {
        Ok((StatusCode::OK, headers).into_response())
    } else {
        Ok((StatusCode::OK, headers, version.manifest_data).into_response())
    }
}

/// Push a manifest under a tag, or under its own digest.
#[tracing::instrument(skip(state, principal, headers, body), fields(operation = "put_manifest"))]
pub(crate) async fn put(
    state: &RegistryState,
    principal: &Principal,
    repository: &str,
    reference: &str,
    headers: &HeaderMap,
    body: Body,
) -> RegistryResult<Response> {
    let repository = RepositoryName::parse(repository)?;
    let reference = Reference::parse(reference)?;

    let db = state.database();
    let organization =
        authz::authorize_reference(db, principal, &repository, &reference, Action::Write).await?;

    let data = axum::body::to_bytes(body, MAX_MANIFEST_SIZE)
        .await
        .map_err(|err| RegistryError::ManifestInvalid(format!("reading body: {err}")))?;

    let media_type = match headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        Some(content_type) => oci::essence(content_type).to_owned(),
        None => oci::detect_media_type(&data),
    };

    let upload = ManifestUpload::parse(&media_type, data.to_vec())?;
    if let Reference::Digest(digest) = &reference {
        if *digest != upload.digest {
            return Err(RegistryError::DigestInvalid(format!(
                "manifest digest {} does not match {digest}",
                upload.digest
            )));
        }
    }

    let outcome = db
        .put_version(
            &organization,
            repository.artifact(),
            &reference,
            &upload,
            principal,
            state.settings().default_tag_limit,
        )
        .await?;
    if outcome != PushOutcome::Unchanged {
        tracing::info!(%repository, %reference, digest = %upload.digest, ?outcome, "pushed manifest");
    }

    let location = format!("/v2/{repository}/manifests/{}", upload.digest);
    let mut response = (
        StatusCode::CREATED,
        [
            (LOCATION, location),
            (DOCKER_CONTENT_DIGEST, upload.digest.to_string()),
        ],
    )
        .into_response();
    if let Some(subject) = oci::subject(&upload.data)
        && let Ok(value) = subject.digest.parse()
    {
        response.headers_mut().insert(OCI_SUBJECT, value);
    }
    Ok(response)
}

/// Delete a tag.
#[tracing::instrument(skip(state, principal), fields(operation = "delete_manifest"))]
pub(crate) async fn delete(
    state: &RegistryState,
    principal: &Principal,
    repository: &str,
    reference: &str,
) -> RegistryResult<Response> {
    let repository = RepositoryName::parse(repository)?;
    let reference = Reference::parse(reference)?;

    let db = state.database();
    let organization =
        authz::authorize_reference(db, principal, &repository, &reference, Action::Write).await?;
    db.delete_tag(organization.id, repository.artifact(), &reference)
        .await?;

    Ok(StatusCode::ACCEPTED.into_response())
}

#[derive(Debug, Serialize)]
struct TagList {
    name: String,
    tags: Vec<String>,
}

/// List the tags of a repository the caller may read.
#[tracing::instrument(skip(state, principal), fields(operation = "list_tags"))]
pub(crate) async fn tags(
    state: &RegistryState,
    principal: &Principal,
    repository: &str,
    query: &str,
) -> RegistryResult<Response> {
    let repository = RepositoryName::parse(repository)?;
    let pagination = Pagination::parse(query)?;
    let limit = pagination.limit(state.settings().page_size)?;

    let db = state.database();
    let organization = authz::authorize(db, principal, &repository, Action::Read).await?;
    let artifact = db.artifact(organization.id, repository.artifact()).await?;

    let scope = Scope::of(db, principal).await?;
    let mut tags = Vec::new();
    for tagged in db.tagged_digests(artifact.id).await? {
        if scope
            .covers_digest(db, organization.id, artifact.id, &tagged.digest)
            .await?
        {
            tags.extend(tagged.tags);
        }
    }

    let (tags, truncated) = paginate(tags, pagination.last.as_deref(), limit);
    let link = truncated
        .then(|| next_link(&format!("/v2/{repository}/tags/list"), &tags, limit))
        .flatten();
    Ok(listing(
        TagList {
            name: repository.to_string(),
            tags,
        },
        link,
    ))
}

#[derive(Debug, Serialize)]
struct Catalog {
    repositories: Vec<String>,
}

/// List the repositories of the caller's tenant it may read.
#[tracing::instrument(skip(state, principal), fields(operation = "catalog"))]
pub(crate) async fn catalog(
    state: &RegistryState,
    principal: &Principal,
    query: &str,
) -> RegistryResult<Response> {
    let pagination = Pagination::parse(query)?;
    let limit = pagination.limit(state.settings().page_size)?;

    let db = state.database();
    let organization = db.organization(principal.organization_id).await?;
    let scope = Scope::of(db, principal).await?;
    let repositories = db
        .list_artifacts(organization.id)
        .await?
        .into_iter()
        .filter(|artifact| scope.covers_artifact(artifact.id))
        .map(|artifact| format!("{}/{}", organization.slug, artifact.name))
        .collect();

    let (repositories, truncated) = paginate(repositories, pagination.last.as_deref(), limit);
    let link = truncated
        .then(|| next_link("/v2/_catalog", &repositories, limit))
        .flatten();
    Ok(listing(Catalog { repositories }, link))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReferrersQuery {
    artifact_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReferrersIndex {
    schema_version: u32,
    media_type: &'static str,
    manifests: Vec<Descriptor>,
}

/// List the manifests in a repository whose subject is `digest`.
#[tracing::instrument(skip(state, principal), fields(operation = "referrers"))]
pub(crate) async fn referrers(
    state: &RegistryState,
    principal: &Principal,
    repository: &str,
    digest: &str,
    query: &str,
) -> RegistryResult<Response> {
    let repository = RepositoryName::parse(repository)?;
    let target = Digest::parse(digest)?;
    let filter: ReferrersQuery =
        serde_urlencoded::from_str(query).map_err(|err| RegistryError::BadRequest(err.to_string()))?;

    let db = state.database();
    let organization = authz::authorize(db, principal, &repository, Action::Read).await?;
    let artifact = db.artifact(organization.id, repository.artifact()).await?;

    // A subject that was never pushed has no readable referrers, not an error.
    if principal.is_customer() {
        match license::authorize(
            db,
            principal,
            repository.artifact(),
            &Reference::Digest(target.clone()),
        )
        .await
        {
            Ok(true) | Err(StoreError::NotFound(Entity::Version)) => {}
            Ok(false) => {
                return Err(RegistryError::Denied(format!(
                    "no license covers {repository}@{target}"
                )));
            }
            Err(err) => return Err(err.into()),
        }
    }

    let scope = Scope::of(db, principal).await?;
    let mut manifests = Vec::new();
    for tagged in db.tagged_digests(artifact.id).await? {
        if !scope
            .covers_digest(db, organization.id, artifact.id, &tagged.digest)
            .await?
        {
            continue;
        }

        let candidate = Digest::parse(&tagged.digest)?;
        let (_, version) = db
            .get_version(organization.id, &artifact.name, &Reference::Digest(candidate))
            .await?;
        let Some(subject) = oci::subject(&version.manifest_data) else {
            continue;
        };
        if subject.digest != target.as_str() {
            continue;
        }

        let artifact_type =
            oci::artifact_type(&version.manifest_content_type, &version.manifest_data);
        if let Some(wanted) = &filter.artifact_type
            && artifact_type.as_ref() != Some(wanted)
        {
            continue;
        }

        manifests.push(Descriptor {
            media_type: Some(version.manifest_content_type),
            digest: version.manifest_digest,
            size: version.manifest_size,
            artifact_type,
        });
    }

    let index = ReferrersIndex {
        schema_version: 2,
        media_type: oci::OCI_INDEX,
        manifests,
    };
    let mut response = ([(CONTENT_TYPE, oci::OCI_INDEX)], Json(index)).into_response();
    if filter.artifact_type.is_some() {
        response
            .headers_mut()
            .insert(OCI_FILTERS_APPLIED, HeaderValue::from_static("artifactType"));
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn pagination_limits() {
        assert_eq!(Pagination::parse("").unwrap().limit(100).unwrap(), 100);
        assert_eq!(Pagination::parse("n=0").unwrap().limit(100).unwrap(), 0);
        assert_eq!(Pagination::parse("n=5&last=b").unwrap().limit(100).unwrap(), 5);
        let err = Pagination::parse("n=-1").unwrap().limit(100).unwrap_err();
        assert_eq!(err.error_code(), "PAGINATION_NUMBER_INVALID");
    }

    #[test]
    fn pages_are_sorted_and_resume_after_last() {
        let items = strings(&["v3", "latest", "v1", "v2"]);
        let (page, more) = paginate(items.clone(), None, 2);
        assert_eq!(page, strings(&["latest", "v1"]));
        assert!(more);

        let (page, more) = paginate(items.clone(), Some("v1"), 2);
        assert_eq!(page, strings(&["v2", "v3"]));
        assert!(!more);

        let (page, more) = paginate(items, None, 0);
        assert!(page.is_empty());
        assert!(more);
    }

    #[test]
    fn next_links() {
        assert_eq!(
            next_link("/v2/acme/app/tags/list", &strings(&["a", "b"]), 2).as_deref(),
            Some("</v2/acme/app/tags/list?n=2&last=b>; rel=\"next\"")
        );
        assert_eq!(next_link("/v2/_catalog", &[], 0), None);
    }
}
