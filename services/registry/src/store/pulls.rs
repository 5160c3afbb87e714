//! The append-only pull log.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::models::{ArtifactVersion, ArtifactVersionPull};
use super::{Database, StoreResult, now, timestamp};
use crate::principal::Principal;

/// Selects pull log entries.
///
/// Entries fall in the window `[after, before)`; `before` defaults to now.
/// Every other set field must match exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullFilter {
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
    pub customer_organization_id: Option<Uuid>,
    pub user_account_id: Option<Uuid>,
    pub remote_address: Option<String>,
    pub artifact_id: Option<Uuid>,
    pub artifact_version_id: Option<Uuid>,
}

/// One selectable value in a filter.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
pub struct FilterOption {
    pub id: Uuid,
    pub name: String,
}

/// The values that actually occur in a tenant's pull log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullFilterOptions {
    pub customer_organizations: Vec<FilterOption>,
    pub user_accounts: Vec<FilterOption>,
    pub remote_addresses: Vec<String>,
    pub artifacts: Vec<FilterOption>,
}

impl Database {
    /// Append a pull of `version` by `principal`.
    pub async fn record_pull(
        &self,
        version: &ArtifactVersion,
        principal: &Principal,
    ) -> StoreResult<()> {
        let mut conn = self.acquire().await?;
        sqlx::query(
            "INSERT INTO artifact_version_pull (
                created_at, artifact_id, artifact_version_id, version_name,
                user_account_id, customer_organization_id, remote_address
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(now())
        .bind(version.artifact_id)
        .bind(version.id)
        .bind(&version.name)
        .bind(principal.user_account_id)
        .bind(principal.customer_organization_id)
        .bind(principal.remote_address.as_deref())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Pulls of the tenant's artifacts matching `filter`, newest first, at most `count`.
    pub async fn query_pulls(
        &self,
        organization_id: Uuid,
        filter: &PullFilter,
        count: i64,
    ) -> StoreResult<Vec<ArtifactVersionPull>> {
        let before = timestamp(filter.before.unwrap_or_else(Utc::now));
        let after = filter.after.map(timestamp);

        let mut conn = self.acquire().await?;
        Ok(sqlx::query_as(
            "SELECT p.id, p.created_at, p.remote_address,
                    p.artifact_id, a.name AS artifact_name,
                    p.artifact_version_id, p.version_name,
                    p.user_account_id, u.name AS user_account_name, u.email AS user_account_email,
                    p.customer_organization_id, c.name AS customer_organization_name
             FROM artifact_version_pull p
             JOIN artifact a ON a.id = p.artifact_id
             LEFT JOIN user_account u ON u.id = p.user_account_id
             LEFT JOIN customer_organization c ON c.id = p.customer_organization_id
             WHERE a.organization_id = ?
               AND p.created_at < ?
               AND (? IS NULL OR p.created_at >= ?)
               AND (? IS NULL OR p.customer_organization_id = ?)
               AND (? IS NULL OR p.user_account_id = ?)
               AND (? IS NULL OR p.remote_address = ?)
               AND (? IS NULL OR p.artifact_id = ?)
               AND (? IS NULL OR p.artifact_version_id = ?)
             ORDER BY p.created_at DESC, p.id DESC
             LIMIT ?",
        )
        .bind(organization_id)
        .bind(before)
        .bind(&after)
        .bind(&after)
        .bind(filter.customer_organization_id)
        .bind(filter.customer_organization_id)
        .bind(filter.user_account_id)
        .bind(filter.user_account_id)
        .bind(filter.remote_address.as_deref())
        .bind(filter.remote_address.as_deref())
        .bind(filter.artifact_id)
        .bind(filter.artifact_id)
        .bind(filter.artifact_version_id)
        .bind(filter.artifact_version_id)
        .bind(count.max(0))
        .fetch_all(&mut *conn)
        .await?)
    }

    /// Distinct customers, users, addresses and artifacts in the tenant's pull log.
    pub async fn pull_filter_options(&self, organization_id: Uuid) -> StoreResult<PullFilterOptions> {
        let mut conn = self.acquire().await?;

        let customer_organizations = sqlx::query_as(
            "SELECT DISTINCT c.id, c.name
             FROM artifact_version_pull p
             JOIN artifact a ON a.id = p.artifact_id
             JOIN customer_organization c ON c.id = p.customer_organization_id
             WHERE a.organization_id = ?
             ORDER BY c.name",
        )
        .bind(organization_id)
        .fetch_all(&mut *conn)
        .await?;

        let user_accounts = sqlx::query_as(
            "SELECT DISTINCT u.id, CASE WHEN u.name = '' THEN u.email ELSE u.name END AS name
             FROM artifact_version_pull p
             JOIN artifact a ON a.id = p.artifact_id
             JOIN user_account u ON u.id = p.user_account_id
             WHERE a.organization_id = ?
             ORDER BY name",
        )
        .bind(organization_id)
        .fetch_all(&mut *conn)
        .await?;

        let remote_addresses = sqlx::query_scalar(
            "SELECT DISTINCT p.remote_address
             FROM artifact_version_pull p
             JOIN artifact a ON a.id = p.artifact_id
             WHERE a.organization_id = ? AND p.remote_address IS NOT NULL
             ORDER BY p.remote_address",
        )
        .bind(organization_id)
        .fetch_all(&mut *conn)
        .await?;

        let artifacts = sqlx::query_as(
            "SELECT DISTINCT a.id, a.name
             FROM artifact_version_pull p
             JOIN artifact a ON a.id = p.artifact_id
             WHERE a.organization_id = ?
             ORDER BY a.name",
        )
        .bind(organization_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(PullFilterOptions {
            customer_organizations,
            user_accounts,
            remote_addresses,
            artifacts,
        })
    }

    /// Distinct version names pulled from one of the tenant's artifacts.
    pub async fn pull_version_options(
        &self,
        organization_id: Uuid,
        artifact_id: Uuid,
    ) -> StoreResult<Vec<String>> {
        let mut conn = self.acquire().await?;
        Ok(sqlx::query_scalar(
            "SELECT DISTINCT p.version_name
             FROM artifact_version_pull p
             JOIN artifact a ON a.id = p.artifact_id
             WHERE a.organization_id = ? AND p.artifact_id = ?
             ORDER BY p.version_name",
        )
        .bind(organization_id)
        .bind(artifact_id)
        .fetch_all(&mut *conn)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::name::Reference;
    use crate::store::fixtures::{self, image, push};

    struct Seed {
        db: Database,
        org: crate::store::models::Organization,
        customer: Principal,
        vendor: Principal,
    }

    async fn seed() -> Seed {
        let db = Database::in_memory().await.unwrap();
        let org = fixtures::organization(&db, "acme").await;
        let initech = fixtures::customer(&db, &org, "Initech").await;
        let user = db.create_user_account("peter@initech.example", "").await.unwrap();

        push(&db, &org, "app", "v1", &image(b"config", &[b"one"])).await;
        push(&db, &org, "app", "v2", &image(b"config", &[b"two"])).await;
        push(&db, &org, "tool", "latest", &image(b"tool", &[])).await;

        let mut customer = Principal::customer(org.id, initech.id, Some(user.id));
        customer.remote_address = Some("192.0.2.10".to_owned());
        let vendor = Principal::vendor(org.id, None);
        Seed {
            db,
            org,
            customer,
            vendor,
        }
    }

    async fn pull(seed: &Seed, artifact: &str, reference: &str, principal: &Principal) {
        let (_, version) = seed
            .db
            .get_version(seed.org.id, artifact, &Reference::parse(reference).unwrap())
            .await
            .unwrap();
        seed.db.record_pull(&version, principal).await.unwrap();
    }

    #[tokio::test]
    async fn pulls_newest_first_with_names() {
        let seed = seed().await;
        pull(&seed, "app", "v1", &seed.customer).await;
        pull(&seed, "app", "v2", &seed.vendor).await;
        pull(&seed, "tool", "latest", &seed.customer).await;

        let pulls = seed
            .db
            .query_pulls(seed.org.id, &PullFilter::default(), 50)
            .await
            .unwrap();
        let names: Vec<_> = pulls
            .iter()
            .map(|p| (p.artifact_name.as_str(), p.version_name.as_str()))
            .collect();
        assert_eq!(names, vec![("tool", "latest"), ("app", "v2"), ("app", "v1")]);

        let first = &pulls[2];
        assert_eq!(first.customer_organization_name.as_deref(), Some("Initech"));
        assert_eq!(
            first.user_account_email.as_deref(),
            Some("peter@initech.example")
        );
        assert_eq!(first.remote_address.as_deref(), Some("192.0.2.10"));
        assert_eq!(pulls[1].customer_organization_id, None);

        let capped = seed
            .db
            .query_pulls(seed.org.id, &PullFilter::default(), 1)
            .await
            .unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[tokio::test]
    async fn filters_narrow_results() {
        let seed = seed().await;
        pull(&seed, "app", "v1", &seed.customer).await;
        pull(&seed, "app", "v2", &seed.vendor).await;
        pull(&seed, "tool", "latest", &seed.customer).await;

        let app = seed.db.artifact(seed.org.id, "app").await.unwrap();
        let filter = PullFilter {
            artifact_id: Some(app.id),
            customer_organization_id: seed.customer.customer_organization_id,
            ..Default::default()
        };
        let pulls = seed.db.query_pulls(seed.org.id, &filter, 50).await.unwrap();
        assert_eq!(pulls.len(), 1);
        assert_eq!(pulls[0].version_name, "v1");

        let by_address = PullFilter {
            remote_address: Some("192.0.2.10".to_owned()),
            ..Default::default()
        };
        assert_eq!(
            seed.db.query_pulls(seed.org.id, &by_address, 50).await.unwrap().len(),
            2
        );

        let future = PullFilter {
            after: Some(Utc::now() + Duration::hours(1)),
            ..Default::default()
        };
        assert!(seed.db.query_pulls(seed.org.id, &future, 50).await.unwrap().is_empty());

        let past = PullFilter {
            before: Some(Utc::now() - Duration::hours(1)),
            ..Default::default()
        };
        assert!(seed.db.query_pulls(seed.org.id, &past, 50).await.unwrap().is_empty());

        let other = fixtures::organization(&seed.db, "globex").await;
        assert!(
            seed.db
                .query_pulls(other.id, &PullFilter::default(), 50)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn filter_options_reflect_the_log() {
        let seed = seed().await;
        pull(&seed, "app", "v1", &seed.customer).await;
        pull(&seed, "app", "v1", &seed.customer).await;
        pull(&seed, "app", "v2", &seed.vendor).await;

        let options = seed.db.pull_filter_options(seed.org.id).await.unwrap();
        assert_eq!(options.customer_organizations.len(), 1);
        assert_eq!(options.customer_organizations[0].name, "Initech");
        // Users without a display name fall back to their email.
        assert_eq!(options.user_accounts.len(), 1);
        assert_eq!(options.user_accounts[0].name, "peter@initech.example");
        assert_eq!(options.remote_addresses, vec!["192.0.2.10"]);
        let artifacts: Vec<_> = options.artifacts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(artifacts, vec!["app"]);

        let app = seed.db.artifact(seed.org.id, "app").await.unwrap();
        assert_eq!(
            seed.db
                .pull_version_options(seed.org.id, app.id)
                .await
                .unwrap(),
            vec!["v1", "v2"]
        );
    }

    #[tokio::test]
    async fn pulls_survive_tag_deletion() {
        let seed = seed().await;
        pull(&seed, "app", "v1", &seed.customer).await;
        seed.db
            .delete_tag(seed.org.id, "app", &Reference::Tag("v1".into()))
            .await
            .unwrap();

        let pulls = seed
            .db
            .query_pulls(seed.org.id, &PullFilter::default(), 50)
            .await
            .unwrap();
        assert_eq!(pulls.len(), 1);
        assert_eq!(pulls[0].version_name, "v1");
        assert_eq!(pulls[0].artifact_version_id, None);
    }
}
