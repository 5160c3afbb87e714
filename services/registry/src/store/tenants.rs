//! Tenants, customers and users.
//!
//! These records belong to the account management backend; the registry
//! reads them and exposes creation so that a standalone deployment and its
//! tests can seed them.

use uuid::Uuid;

use super::models::{CustomerOrganization, Organization, UserAccount};
use super::{Database, Entity, StoreError, StoreResult, now};

/// Attributes of a new tenant.
#[derive(Debug, Clone)]
pub struct NewOrganization {
    slug: String,
    name: String,
    plan: String,
    artifact_tag_limit: Option<i64>,
    mutable_tags: bool,
}

impl NewOrganization {
    /// A tenant on the community plan with immutable tags and the default tag limit.
    pub fn new(slug: impl Into<String>) -> Self {
        let slug = slug.into();
        Self {
            name: slug.clone(),
            slug,
            plan: "community".to_owned(),
            artifact_tag_limit: None,
            mutable_tags: false,
        }
    }

    /// Display name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Subscription plan.
    pub fn plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = plan.into();
        self
    }

    /// Tags allowed per artifact; `0` means unlimited.
    pub fn tag_limit(mut self, limit: i64) -> Self {
        self.artifact_tag_limit = Some(limit);
        self
    }

    /// Allow tags to be moved to new content.
    pub fn mutable_tags(mut self, mutable: bool) -> Self {
        self.mutable_tags = mutable;
        self
    }
}

impl Database {
    /// Create a tenant.
    pub async fn create_organization(&self, new: NewOrganization) -> StoreResult<Organization> {
        let id = Uuid::new_v4();
        let mut tx = self.begin().await?;
        sqlx::query(
            "INSERT INTO organization (id, created_at, slug, name, plan, artifact_tag_limit, mutable_tags)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(now())
        .bind(&new.slug)
        .bind(&new.name)
        .bind(&new.plan)
        .bind(new.artifact_tag_limit)
        .bind(new.mutable_tags)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.organization(id).await
    }

    /// Look up a tenant by id.
    pub async fn organization(&self, id: Uuid) -> StoreResult<Organization> {
        let mut conn = self.acquire().await?;
        sqlx::query_as("SELECT * FROM organization WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(StoreError::NotFound(Entity::Organization))
    }

    /// Look up a tenant by the slug used in repository names.
    pub async fn organization_by_slug(&self, slug: &str) -> StoreResult<Option<Organization>> {
        let mut conn = self.acquire().await?;
        Ok(sqlx::query_as("SELECT * FROM organization WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&mut *conn)
            .await?)
    }

    /// Create a customer of a tenant.
    pub async fn create_customer_organization(
        &self,
        organization_id: Uuid,
        name: &str,
    ) -> StoreResult<CustomerOrganization> {
        let id = Uuid::new_v4();
        let mut tx = self.begin().await?;
        sqlx::query(
            "INSERT INTO customer_organization (id, created_at, organization_id, name)
             VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(now())
        .bind(organization_id)
        .bind(name)
        .execute(&mut *tx)
        .await?;

        let customer = sqlx::query_as("SELECT * FROM customer_organization WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(customer)
    }

    /// Create a user account.
    pub async fn create_user_account(&self, email: &str, name: &str) -> StoreResult<UserAccount> {
        let id = Uuid::new_v4();
        let mut tx = self.begin().await?;
        sqlx::query("INSERT INTO user_account (id, created_at, email, name) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(now())
            .bind(email)
            .bind(name)
            .execute(&mut *tx)
            .await?;

        let user = sqlx::query_as("SELECT * FROM user_account WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(user)
    }
}
