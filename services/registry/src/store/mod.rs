//! SQLite-backed store for artifacts, versions, licenses and pulls.
//!
//! Reads run on a pooled connection. Writes run inside a [`Tx`], which is
//! also serialized against every other write in the process, so a
//! check-then-insert (tag quota, tag replacement) cannot interleave with
//! another push.

use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::{Sqlite, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};

mod artifacts;
mod error;
mod licenses;
pub mod models;
mod pulls;
mod tenants;
mod versions;

pub use error::{Entity, StoreError, StoreResult};
pub use licenses::NewLicense;
pub use pulls::{FilterOption, PullFilter, PullFilterOptions};
pub use tenants::NewOrganization;
pub use versions::{ManifestUpload, PushOutcome, TaggedDigest};

/// Connection pool for the registry database.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

impl Database {
    /// Open (creating if missing) the database at `url` and run migrations.
    ///
    /// `url` is a sqlx SQLite URL such as `sqlite://registry.db`.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// A private in-memory database.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true);

        // The database lives exactly as long as its only connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> StoreResult<Self> {
        let db = Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// A pooled connection for reads.
    pub(crate) async fn acquire(&self) -> StoreResult<PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }

    /// Begin a write transaction. Dropping it without [`Tx::commit`] rolls back.
    pub(crate) async fn begin(&self) -> StoreResult<Tx> {
        let guard = self.writer.clone().lock_owned().await;
        let inner = self.pool.begin().await?;
        Ok(Tx {
            inner,
            _guard: guard,
        })
    }
}

/// A write transaction holding the process-wide write gate.
pub(crate) struct Tx {
    inner: Transaction<'static, Sqlite>,
    _guard: OwnedMutexGuard<()>,
}

impl Tx {
    pub(crate) async fn commit(self) -> StoreResult<()> {
        self.inner.commit().await?;
        Ok(())
    }
}

impl Deref for Tx {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for Tx {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// Fixed-width UTC timestamp text, so that stored times sort lexicographically.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

pub(crate) fn now() -> String {
    timestamp(Utc::now())
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Seed data shared by store, license and handler tests.

    use uuid::Uuid;

    use super::models::{Artifact, ArtifactVersion, CustomerOrganization, Organization};
    use super::*;
    use crate::name::{Digest, Reference};
    use crate::oci;
    use crate::principal::Principal;

    pub(crate) async fn organization(db: &Database, slug: &str) -> Organization {
        db.create_organization(NewOrganization::new(slug))
            .await
            .unwrap()
    }

    pub(crate) async fn customer(
        db: &Database,
        org: &Organization,
        name: &str,
    ) -> CustomerOrganization {
        db.create_customer_organization(org.id, name).await.unwrap()
    }

    pub(crate) fn vendor(org: &Organization) -> Principal {
        Principal::vendor(org.id, None)
    }

    /// An image manifest referencing a config and the given layers.
    pub(crate) fn image(config: &[u8], layers: &[&[u8]]) -> ManifestUpload {
        let descriptor = |data: &[u8]| {
            format!(
                r#"{{"mediaType":"application/octet-stream","digest":"{}","size":{}}}"#,
                Digest::sha256(data),
                data.len()
            )
        };
        let layers: Vec<String> = layers.iter().map(|l| descriptor(l)).collect();
        let body = format!(
            r#"{{"schemaVersion":2,"mediaType":"{}","config":{},"layers":[{}]}}"#,
            oci::OCI_MANIFEST,
            descriptor(config),
            layers.join(",")
        );
        ManifestUpload::parse(oci::OCI_MANIFEST, body.into_bytes()).unwrap()
    }

    /// An index referencing the given manifests.
    pub(crate) fn index(children: &[&ManifestUpload]) -> ManifestUpload {
        let manifests: Vec<String> = children
            .iter()
            .map(|child| {
                format!(
                    r#"{{"mediaType":"{}","digest":"{}","size":{}}}"#,
                    child.media_type, child.digest, child.size
                )
            })
            .collect();
        let body = format!(
            r#"{{"schemaVersion":2,"mediaType":"{}","manifests":[{}]}}"#,
            oci::OCI_INDEX,
            manifests.join(",")
        );
        ManifestUpload::parse(oci::OCI_INDEX, body.into_bytes()).unwrap()
    }

    pub(crate) async fn push(
        db: &Database,
        org: &Organization,
        artifact: &str,
        tag: &str,
        upload: &ManifestUpload,
    ) -> PushOutcome {
        db.put_version(
            org,
            artifact,
            &Reference::Tag(tag.to_owned()),
            upload,
            &vendor(org),
            0,
        )
        .await
        .unwrap()
    }

    pub(crate) async fn version(
        db: &Database,
        org: &Organization,
        artifact: &str,
        reference: &str,
    ) -> (Artifact, ArtifactVersion) {
        db.get_version(org.id, artifact, &Reference::parse(reference).unwrap())
            .await
            .unwrap()
    }

    pub(crate) fn unknown() -> Uuid {
        Uuid::new_v4()
    }
}
