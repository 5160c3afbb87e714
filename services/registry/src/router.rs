//! Dispatch of `/v2/...` requests.
//!
//! Repository names contain slashes, so the resource kind is found from
//! the trailing segments of the path rather than from axum's route table.

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, Method};
use axum::response::Response;

use crate::api::RegistryState;
use crate::error::{RegistryError, RegistryResult};
use crate::principal::Principal;
use crate::{blob, manifest};

/// The resource addressed by a path below `/v2/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    /// `_catalog`
    Catalog,
    /// `<repository>/manifests/<reference>`
    Manifest {
        repository: &'a str,
        reference: &'a str,
    },
    /// `<repository>/tags/list`
    Tags { repository: &'a str },
    /// `<repository>/referrers/<digest>`
    Referrers { repository: &'a str, digest: &'a str },
    /// `<repository>/blobs/<digest>`
    Blob { repository: &'a str, digest: &'a str },
    /// `<repository>/blobs/uploads/[<session>]`
    BlobUpload {
        repository: &'a str,
        session: Option<&'a str>,
    },
}

/// Split `path` at the last `/<kind>/` into a repository and a single final segment.
fn trailing<'a>(path: &'a str, kind: &str) -> Option<(&'a str, &'a str)> {
    let (repository, last) = path.rsplit_once(kind)?;
    (!repository.is_empty() && !last.is_empty() && !last.contains('/'))
        .then_some((repository, last))
}

impl<'a> Route<'a> {
    /// Decompose a path relative to `/v2/`. `None` if it addresses nothing.
    pub fn parse(path: &'a str) -> Option<Self> {
        let path = path.trim_start_matches('/');

        if path == "_catalog" {
            return Some(Route::Catalog);
        }
        if let Some(repository) = path.strip_suffix("/tags/list") {
            return (!repository.is_empty()).then_some(Route::Tags { repository });
        }
        if let Some(repository) = path
            .strip_suffix("/blobs/uploads/")
            .or_else(|| path.strip_suffix("/blobs/uploads"))
        {
            return (!repository.is_empty()).then_some(Route::BlobUpload {
                repository,
                session: None,
            });
        }
        if let Some((repository, session)) = trailing(path, "/blobs/uploads/") {
            return Some(Route::BlobUpload {
                repository,
                session: Some(session),
            });
        }
        if let Some((repository, reference)) = trailing(path, "/manifests/") {
            return Some(Route::Manifest {
                repository,
                reference,
            });
        }
        if let Some((repository, digest)) = trailing(path, "/referrers/") {
            return Some(Route::Referrers { repository, digest });
        }
        if let Some((repository, digest)) = trailing(path, "/blobs/") {
            return Some(Route::Blob { repository, digest });
        }
        None
    }
}

/// Handle every request below `/v2/`.
#[tracing::instrument(skip_all, fields(%method))]
pub(crate) async fn dispatch(
    State(state): State<RegistryState>,
    principal: Principal,
    method: Method,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Body,
) -> RegistryResult<Response> {
    let route = Route::parse(&path).ok_or_else(|| RegistryError::NameUnknown(path.clone()))?;
    let query = query.unwrap_or_default();
    tracing::debug!(?route, "dispatching");

    match route {
        Route::Catalog => match method {
            Method::GET => manifest::catalog(&state, &principal, &query).await,
            _ => Err(method_unknown(&method, &path)),
        },
        Route::Manifest {
            repository,
            reference,
        } => match method {
            Method::GET => manifest::get(&state, &principal, repository, reference, false).await,
            Method::HEAD => manifest::get(&state, &principal, repository, reference, true).await,
            Method::PUT => {
                manifest::put(&state, &principal, repository, reference, &headers, body).await
            }
            Method::DELETE => manifest::delete(&state, &principal, repository, reference).await,
            _ => Err(method_unknown(&method, &path)),
        },
        Route::Tags { repository } => match method {
            Method::GET => manifest::tags(&state, &principal, repository, &query).await,
            _ => Err(method_unknown(&method, &path)),
        },
        Route::Referrers { repository, digest } => match method {
            Method::GET => {
                manifest::referrers(&state, &principal, repository, digest, &query).await
            }
            _ => Err(method_unknown(&method, &path)),
        },
        Route::Blob { repository, digest } => match method {
            Method::GET => blob::get(&state, &principal, repository, digest, false).await,
            Method::HEAD => blob::get(&state, &principal, repository, digest, true).await,
            Method::DELETE => Err(RegistryError::Unsupported(
                "blobs are shared between repositories and cannot be deleted".to_owned(),
            )),
            _ => Err(method_unknown(&method, &path)),
        },
        Route::BlobUpload {
            repository,
            session: None,
        } => match method {
            Method::POST => blob::start_upload(&state, &principal, repository, &query, body).await,
            _ => Err(method_unknown(&method, &path)),
        },
        Route::BlobUpload {
            repository,
            session: Some(session),
        } => match method {
            Method::GET => blob::upload_status(&state, &principal, repository, session).await,
            Method::PATCH => {
                blob::append_upload(&state, &principal, repository, session, &headers, body).await
            }
            Method::PUT => {
                blob::complete_upload(&state, &principal, repository, session, &query, body).await
            }
            Method::DELETE => blob::cancel_upload(&state, &principal, repository, session).await,
            _ => Err(method_unknown(&method, &path)),
        },
    }
}

fn method_unknown(method: &Method, path: &str) -> RegistryError {
    RegistryError::MethodUnknown(format!("{method} /v2/{path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifests_and_tags() {
        assert_eq!(
            Route::parse("acme/team/app/manifests/v1"),
            Some(Route::Manifest {
                repository: "acme/team/app",
                reference: "v1"
            })
        );
        assert_eq!(
            Route::parse("acme/app/tags/list"),
            Some(Route::Tags {
                repository: "acme/app"
            })
        );
        assert_eq!(Route::parse("_catalog"), Some(Route::Catalog));
    }

    #[test]
    fn repository_segments_may_look_like_kinds() {
        assert_eq!(
            Route::parse("acme/manifests/manifests/sha256:abc"),
            Some(Route::Manifest {
                repository: "acme/manifests",
                reference: "sha256:abc"
            })
        );
        assert_eq!(
            Route::parse("acme/blobs/blobs/sha256:abc"),
            Some(Route::Blob {
                repository: "acme/blobs",
                digest: "sha256:abc"
            })
        );
    }

    #[test]
    fn referrers_and_blobs() {
        assert_eq!(
            Route::parse("acme/app/referrers/sha256:abc"),
            Some(Route::Referrers {
                repository: "acme/app",
                digest: "sha256:abc"
            })
        );
        assert_eq!(
            Route::parse("acme/app/blobs/uploads/"),
            Some(Route::BlobUpload {
                repository: "acme/app",
                session: None
            })
        );
        assert_eq!(
            Route::parse("acme/app/blobs/uploads"),
            Some(Route::BlobUpload {
                repository: "acme/app",
                session: None
            })
        );
        assert_eq!(
            Route::parse("acme/app/blobs/uploads/5c1d"),
            Some(Route::BlobUpload {
                repository: "acme/app",
                session: Some("5c1d")
            })
        );
    }

    #[test]
    fn unknown_shapes() {
        for path in [
            "",
            "acme",
            "acme/app",
            "acme/app/manifests/",
            "/manifests/v1",
            "acme/app/tags",
            "acme/app/manifests/v1/extra",
        ] {
            assert_eq!(Route::parse(path), None, "{path}");
        }
    }
}
