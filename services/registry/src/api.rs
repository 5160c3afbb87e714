//! API server builder and router

use std::fmt;
use std::sync::Arc;

use axum::Router;
use axum::http::HeaderName;
use axum::response::{IntoResponse, Json};
use axum::routing::{any, get};
use serde_json::json;

use crate::blob::UploadSessions;
use crate::config::{ExportSettings, RegistrySettings};
use crate::principal::{Authenticator, Principal, TokenAuthenticator};
use crate::store::Database;

pub(crate) const API_VERSION: HeaderName = HeaderName::from_static("docker-distribution-api-version");

/// Registry builder for configuring and creating the registry service
pub struct RegistryBuilder {
    database: Database,
    storage: storage::Storage,
    authenticator: Arc<dyn Authenticator>,
    settings: RegistrySettings,
    export: ExportSettings,
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("storage", &self.storage)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RegistryBuilder {
    /// Create a new registry builder over a database and a blob store.
    ///
    /// Until an authenticator is set, every request is rejected as unauthenticated.
    pub fn new(database: Database, storage: storage::Storage) -> Self {
        Self {
            database,
            storage,
            authenticator: Arc::new(TokenAuthenticator::new()),
            settings: RegistrySettings::default(),
            export: ExportSettings::default(),
        }
    }

    /// Set the authenticator which turns credentials into principals
    pub fn authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticator = Arc::new(authenticator);
        self
    }

    /// Set protocol settings
    pub fn settings(mut self, settings: RegistrySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set pull log export limits
    pub fn export(mut self, export: ExportSettings) -> Self {
        self.export = export;
        self
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Router {
        let uploads = UploadSessions::new(
            self.settings.upload_timeout(),
            self.settings.max_blob_size,
        );
        let state = RegistryState {
            inner: Arc::new(Inner {
                database: self.database,
                storage: self.storage,
                authenticator: self.authenticator,
                settings: self.settings,
                export: self.export,
                uploads,
            }),
        };

        Router::new()
            .route("/v2", get(api_version_check))
            .route("/v2/", get(api_version_check))
            .route("/v2/{*path}", any(crate::router::dispatch))
            .nest("/api/v1/artifacts", crate::artifacts::router())
            .nest("/api/v1/artifact-pulls", crate::audit::router())
            .with_state(state)
    }
}

/// Shared state of a running registry.
#[derive(Debug, Clone)]
pub struct RegistryState {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    database: Database,
    storage: storage::Storage,
    authenticator: Arc<dyn Authenticator>,
    settings: RegistrySettings,
    export: ExportSettings,
    uploads: UploadSessions,
}

impl RegistryState {
    pub(crate) fn database(&self) -> &Database {
        &self.inner.database
    }

    pub(crate) fn storage(&self) -> &storage::Storage {
        &self.inner.storage
    }

    pub(crate) fn authenticator(&self) -> &dyn Authenticator {
        self.inner.authenticator.as_ref()
    }

    pub(crate) fn settings(&self) -> &RegistrySettings {
        &self.inner.settings
    }

    pub(crate) fn export(&self) -> &ExportSettings {
        &self.inner.export
    }

    pub(crate) fn uploads(&self) -> &UploadSessions {
        &self.inner.uploads
    }
}

/// API version check endpoint
///
/// Returns 200 OK to authenticated callers
async fn api_version_check(_principal: Principal) -> impl IntoResponse {
    ([(API_VERSION, "registry/2.0")], Json(json!({})))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;

    #[tokio::test]
    async fn version_check_requires_credentials() {
        let db = Database::in_memory().await.unwrap();
        let principal = Principal::vendor(uuid::Uuid::new_v4(), None);
        let app = RegistryBuilder::new(db, storage::MemoryDriver::new().into())
            .authenticator(TokenAuthenticator::new().with_token("t0ken", principal))
            .build();

        let response = app
            .clone()
            .oneshot(Request::get("/v2/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::get("/v2/")
                    .header("authorization", "Bearer t0ken")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[API_VERSION], "registry/2.0");
    }
}
