//! Blob operations for the registry

use std::collections::HashMap;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use storage::Fetch;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::api::RegistryState;
use crate::authz::{self, Action};
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::DOCKER_CONTENT_DIGEST;
use crate::name::{Digest, RepositoryName};
use crate::principal::Principal;

const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");

/// In-progress chunked uploads, keyed by session id.
///
/// Sessions idle for longer than the timeout are discarded the next time
/// any session is touched.
#[derive(Debug)]
pub(crate) struct UploadSessions {
    timeout: Duration,
    max_size: usize,
    sessions: Mutex<HashMap<Uuid, Upload>>,
}

#[derive(Debug)]
struct Upload {
    repository: RepositoryName,
    data: BytesMut,
    touched: Instant,
}

impl Upload {
    fn expired(&self, timeout: Duration) -> bool {
        self.touched.elapsed() >= timeout
    }
}

impl UploadSessions {
    pub(crate) fn new(timeout: Duration, max_size: usize) -> Self {
        Self {
            timeout,
            max_size,
            sessions: Mutex::default(),
        }
    }

    /// Largest blob a session (or a single request body) may hold.
    pub(crate) fn max_size(&self) -> usize {
        self.max_size
    }

    async fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Upload>> {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, upload| !upload.expired(self.timeout));
        let evicted = before - sessions.len();
        if evicted > 0 {
            tracing::debug!(evicted, "discarded idle uploads");
        }
        sessions
    }

    async fn open(&self, repository: &RepositoryName) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().await.insert(
            id,
            Upload {
                repository: repository.clone(),
                data: BytesMut::new(),
                touched: Instant::now(),
            },
        );
        id
    }

    /// Append a chunk, returning the new length.
    async fn append(
        &self,
        repository: &RepositoryName,
        session: &str,
        offset: Option<usize>,
        chunk: &[u8],
    ) -> RegistryResult<usize> {
        let mut sessions = self.lock().await;
        let upload = lookup(&mut sessions, repository, session)?;
        if let Some(offset) = offset
            && offset != upload.data.len()
        {
            return Err(RegistryError::BlobUploadInvalid(format!(
                "chunk starts at {offset}, upload has {} bytes",
                upload.data.len()
            )));
        }
        if upload.data.len() + chunk.len() > self.max_size {
            return Err(RegistryError::BlobUploadInvalid(format!(
                "upload would exceed {} bytes",
                self.max_size
            )));
        }
        upload.data.extend_from_slice(chunk);
        upload.touched = Instant::now();
        Ok(upload.data.len())
    }

    async fn len(&self, repository: &RepositoryName, session: &str) -> RegistryResult<usize> {
        let mut sessions = self.lock().await;
        Ok(lookup(&mut sessions, repository, session)?.data.len())
    }

    async fn take(&self, repository: &RepositoryName, session: &str) -> RegistryResult<Bytes> {
        let mut sessions = self.lock().await;
        lookup(&mut sessions, repository, session)?;
        let id = parse_session(session)?;
        sessions
            .remove(&id)
            .map(|upload| upload.data.freeze())
            .ok_or_else(|| RegistryError::BlobUploadUnknown(session.to_owned()))
    }
}

fn parse_session(session: &str) -> RegistryResult<Uuid> {
    session
        .parse()
        .map_err(|_| RegistryError::BlobUploadUnknown(session.to_owned()))
}

fn lookup<'s>(
    sessions: &'s mut HashMap<Uuid, Upload>,
    repository: &RepositoryName,
    session: &str,
) -> RegistryResult<&'s mut Upload> {
    let id = parse_session(session)?;
    sessions
        .get_mut(&id)
        .filter(|upload| upload.repository == *repository)
        .ok_or_else(|| RegistryError::BlobUploadUnknown(session.to_owned()))
}

#[derive(Debug, Default, Deserialize)]
struct UploadQuery {
    digest: Option<String>,
}

impl UploadQuery {
    fn parse(query: &str) -> RegistryResult<Self> {
        serde_urlencoded::from_str(query).map_err(|err| RegistryError::BadRequest(err.to_string()))
    }
}

/// Start of a `Content-Range: <start>-<end>` header.
fn range_start(headers: &HeaderMap) -> RegistryResult<Option<usize>> {
    let Some(value) = headers.get(CONTENT_RANGE) else {
        return Ok(None);
    };
    let invalid = || RegistryError::BlobUploadInvalid("malformed Content-Range".to_owned());
    let value = value.to_str().map_err(|_| invalid())?;
    let value = value.strip_prefix("bytes ").unwrap_or(value);
    let (start, _) = value.split_once('-').ok_or_else(invalid)?;
    start.trim().parse().map(Some).map_err(|_| invalid())
}

async fn read_body(state: &RegistryState, body: Body) -> RegistryResult<Bytes> {
    axum::body::to_bytes(body, state.uploads().max_size())
        .await
        .map_err(|err| RegistryError::BlobUploadInvalid(format!("reading body: {err}")))
}

fn progress(repository: &RepositoryName, session: &str, status: StatusCode, len: usize) -> Response {
    // Range is inclusive; an empty upload reports 0-0.
    let end = len.saturating_sub(1);
    (
        status,
        [
            (LOCATION, format!("/v2/{repository}/blobs/uploads/{session}")),
            (RANGE, format!("0-{end}")),
            (DOCKER_UPLOAD_UUID, session.to_owned()),
            (CONTENT_LENGTH, "0".to_owned()),
        ],
    )
        .into_response()
}

/// Verify and store a complete blob.
async fn commit(
    state: &RegistryState,
    repository: &RepositoryName,
    digest: &str,
    data: &[u8],
) -> RegistryResult<Response> {
    let digest = Digest::parse(digest)?;
    if !digest.verify(data) {
        return Err(RegistryError::DigestInvalid(format!(
            "uploaded content does not match {digest}"
        )));
    }

    let mut reader = data;
    let metadata = state
        .storage()
        .put(&repository.to_string(), digest.as_str(), &mut reader)
        .await?;
    tracing::debug!(%repository, %digest, size = metadata.size, "stored blob");

    Ok((
        StatusCode::CREATED,
        [
            (LOCATION, format!("/v2/{repository}/blobs/{digest}")),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
            (CONTENT_LENGTH, "0".to_owned()),
        ],
    )
        .into_response())
}

/// Fetch (or, with `head`, stat) a blob.
#[tracing::instrument(skip(state, principal), fields(operation = "get_blob"))]
pub(crate) async fn get(
    state: &RegistryState,
    principal: &Principal,
    repository: &str,
    digest: &str,
    head: bool,
) -> RegistryResult<Response> {
    let repository = RepositoryName::parse(repository)?;
    let digest = Digest::parse(digest)?;
    authz::authorize_blob(state.database(), principal, &repository, &digest).await?;
    let name = repository.to_string();

    if head {
        let metadata = state
            .storage()
            .metadata(&name, digest.as_str())
            .await?;
        return Ok((
            StatusCode::OK,
            [
                (CONTENT_TYPE, "application/octet-stream".to_owned()),
                (CONTENT_LENGTH, metadata.size.to_string()),
                (DOCKER_CONTENT_DIGEST, digest.to_string()),
            ],
        )
            .into_response());
    }

    match state
        .storage()
        .get(&name, digest.as_str(), true)
        .await?
    {
        Fetch::Stream { metadata, reader } => Ok((
            StatusCode::OK,
            [
                (CONTENT_TYPE, "application/octet-stream".to_owned()),
                (CONTENT_LENGTH, metadata.size.to_string()),
                (DOCKER_CONTENT_DIGEST, digest.to_string()),
            ],
            Body::from_stream(ReaderStream::new(reader)),
        )
            .into_response()),
        Fetch::Redirect { location } => Ok((
            StatusCode::TEMPORARY_REDIRECT,
            [
                (LOCATION, location),
                (DOCKER_CONTENT_DIGEST, digest.to_string()),
            ],
        )
            .into_response()),
    }
}

/// Start an upload. With `?digest=` the body is the whole blob.
#[tracing::instrument(skip(state, principal, body), fields(operation = "start_upload"))]
pub(crate) async fn start_upload(
    state: &RegistryState,
    principal: &Principal,
    repository: &str,
    query: &str,
    body: Body,
) -> RegistryResult<Response> {
    let repository = RepositoryName::parse(repository)?;
    authz::authorize(state.database(), principal, &repository, Action::Write).await?;
    let query = UploadQuery::parse(query)?;

    if let Some(digest) = query.digest {
        let data = read_body(state, body).await?;
        return commit(state, &repository, &digest, &data).await;
    }

    let session = state.uploads().open(&repository).await.to_string();
    tracing::debug!(%repository, %session, "opened upload");
    Ok(progress(&repository, &session, StatusCode::ACCEPTED, 0))
}

/// Report how much of an upload has been received.
#[tracing::instrument(skip(state, principal), fields(operation = "upload_status"))]
pub(crate) async fn upload_status(
    state: &RegistryState,
    principal: &Principal,
    repository: &str,
    session: &str,
) -> RegistryResult<Response> {
    let repository = RepositoryName::parse(repository)?;
    authz::authorize(state.database(), principal, &repository, Action::Write).await?;
    let len = state.uploads().len(&repository, session).await?;
    Ok(progress(&repository, session, StatusCode::NO_CONTENT, len))
}

/// Append a chunk to an upload.
#[tracing::instrument(skip(state, principal, headers, body), fields(operation = "append_upload"))]
pub(crate) async fn append_upload(
    state: &RegistryState,
    principal: &Principal,
    repository: &str,
    session: &str,
    headers: &HeaderMap,
    body: Body,
) -> RegistryResult<Response> {
    let repository = RepositoryName::parse(repository)?;
    authz::authorize(state.database(), principal, &repository, Action::Write).await?;
    let offset = range_start(headers)?;
    let chunk = read_body(state, body).await?;
    let len = state
        .uploads()
        .append(&repository, session, offset, &chunk)
        .await?;
    Ok(progress(&repository, session, StatusCode::ACCEPTED, len))
}

/// Finish an upload with its final chunk and verify the digest.
#[tracing::instrument(skip(state, principal, body), fields(operation = "complete_upload"))]
pub(crate) async fn complete_upload(
    state: &RegistryState,
    principal: &Principal,
    repository: &str,
    session: &str,
    query: &str,
    body: Body,
) -> RegistryResult<Response> {
    let repository = RepositoryName::parse(repository)?;
    authz::authorize(state.database(), principal, &repository, Action::Write).await?;
    let digest = UploadQuery::parse(query)?
        .digest
        .ok_or_else(|| RegistryError::DigestInvalid("missing digest parameter".to_owned()))?;

    let chunk = read_body(state, body).await?;
    if !chunk.is_empty() {
        state
            .uploads()
            .append(&repository, session, None, &chunk)
            .await?;
    }
    let data = state.uploads().take(&repository, session).await?;
    commit(state, &repository, &digest, &data).await
}

/// Abandon an upload.
#[tracing::instrument(skip(state, principal), fields(operation = "cancel_upload"))]
pub(crate) async fn cancel_upload(
    state: &RegistryState,
    principal: &Principal,
    repository: &str,
    session: &str,
) -> RegistryResult<Response> {
    let repository = RepositoryName::parse(repository)?;
    authz::authorize(state.database(), principal, &repository, Action::Write).await?;
    state.uploads().take(&repository, session).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(name: &str) -> RepositoryName {
        RepositoryName::parse(name).unwrap()
    }

    fn sessions() -> UploadSessions {
        UploadSessions::new(Duration::from_secs(60), 1024)
    }

    #[tokio::test]
    async fn sessions_accumulate_chunks() {
        let uploads = sessions();
        let repository = repo("acme/app");
        let id = uploads.open(&repository).await.to_string();

        assert_eq!(uploads.append(&repository, &id, Some(0), b"hello ").await.unwrap(), 6);
        assert_eq!(uploads.append(&repository, &id, None, b"world").await.unwrap(), 11);
        assert_eq!(uploads.len(&repository, &id).await.unwrap(), 11);

        let err = uploads
            .append(&repository, &id, Some(3), b"!")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "BLOB_UPLOAD_INVALID");

        let data = uploads.take(&repository, &id).await.unwrap();
        assert_eq!(&data[..], b"hello world");

        let err = uploads.len(&repository, &id).await.unwrap_err();
        assert_eq!(err.error_code(), "BLOB_UPLOAD_UNKNOWN");
    }

    #[tokio::test]
    async fn sessions_belong_to_one_repository() {
        let uploads = sessions();
        let id = uploads.open(&repo("acme/app")).await.to_string();

        let err = uploads.len(&repo("acme/other"), &id).await.unwrap_err();
        assert_eq!(err.error_code(), "BLOB_UPLOAD_UNKNOWN");
        let err = uploads.len(&repo("acme/app"), "not-a-uuid").await.unwrap_err();
        assert_eq!(err.error_code(), "BLOB_UPLOAD_UNKNOWN");
    }

    #[tokio::test]
    async fn uploads_are_capped() {
        let uploads = UploadSessions::new(Duration::from_secs(60), 8);
        let repository = repo("acme/app");
        let id = uploads.open(&repository).await.to_string();

        uploads.append(&repository, &id, None, b"12345678").await.unwrap();
        let err = uploads
            .append(&repository, &id, None, b"9")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "BLOB_UPLOAD_INVALID");
        assert_eq!(uploads.len(&repository, &id).await.unwrap(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_expire() {
        let uploads = sessions();
        let repository = repo("acme/app");
        let idle = uploads.open(&repository).await.to_string();
        let active = uploads.open(&repository).await.to_string();

        tokio::time::advance(Duration::from_secs(40)).await;
        uploads.append(&repository, &active, None, b"ping").await.unwrap();

        tokio::time::advance(Duration::from_secs(40)).await;
        let err = uploads.len(&repository, &idle).await.unwrap_err();
        assert_eq!(err.error_code(), "BLOB_UPLOAD_UNKNOWN");
        assert_eq!(uploads.len(&repository, &active).await.unwrap(), 4);
        assert_eq!(uploads.sessions.lock().await.len(), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        let err = uploads.take(&repository, &active).await.unwrap_err();
        assert_eq!(err.error_code(), "BLOB_UPLOAD_UNKNOWN");
        assert!(uploads.sessions.lock().await.is_empty());
    }

    #[test]
    fn content_ranges() {
        let mut headers = HeaderMap::new();
        assert_eq!(range_start(&headers).unwrap(), None);

        headers.insert(CONTENT_RANGE, "10-19".parse().unwrap());
        assert_eq!(range_start(&headers).unwrap(), Some(10));

        headers.insert(CONTENT_RANGE, "bytes 0-4".parse().unwrap());
        assert_eq!(range_start(&headers).unwrap(), Some(0));

        headers.insert(CONTENT_RANGE, "garbage".parse().unwrap());
        assert!(range_start(&headers).is_err());
    }
}
