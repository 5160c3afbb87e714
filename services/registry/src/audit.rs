//! Pull audit log: recording pulls and the vendor-facing query API.

use axum::Json;
use axum::Router;
use axum::extract::{RawQuery, State};
use axum::http::StatusCode;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::RegistryState;
use crate::error::{RegistryError, RegistryResult};
use crate::principal::Principal;
use crate::store::models::{ArtifactVersion, ArtifactVersionPull, Organization};
use crate::store::PullFilter;

const DEFAULT_COUNT: i64 = 50;

/// Record a pull. Failures are reported and otherwise ignored.
pub(crate) async fn record_pull(
    state: &RegistryState,
    version: &ArtifactVersion,
    principal: &Principal,
) {
    if let Err(error) = state.database().record_pull(version, principal).await {
        tracing::warn!(%error, version = %version.id, "failed to record pull");
        sentry::capture_error(&error);
    }
}

pub(crate) fn router() -> Router<RegistryState> {
    Router::new()
        .route("/", get(list_pulls))
        .route("/filter-options", get(filter_options))
        .route("/filter-options/versions", get(version_options))
        .route("/export", get(export_pulls))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullsQuery {
    before: Option<DateTime<Utc>>,
    after: Option<DateTime<Utc>>,
    count: Option<i64>,
    customer_organization_id: Option<Uuid>,
    user_account_id: Option<Uuid>,
    remote_address: Option<String>,
    artifact_id: Option<Uuid>,
    artifact_version_id: Option<Uuid>,
}

impl PullsQuery {
    fn filter(&self) -> PullFilter {
        PullFilter {
            before: self.before,
            after: self.after,
            customer_organization_id: self.customer_organization_id,
            user_account_id: self.user_account_id,
            remote_address: self.remote_address.clone(),
            artifact_id: self.artifact_id,
            artifact_version_id: self.artifact_version_id,
        }
    }
}

fn parse_query<T: serde::de::DeserializeOwned>(query: Option<String>) -> RegistryResult<T> {
    serde_urlencoded::from_str(query.as_deref().unwrap_or_default())
        .map_err(|err| RegistryError::BadRequest(err.to_string()))
}

/// The vendor organization of `principal`; customers may not see the log.
async fn vendor_organization(
    state: &RegistryState,
    principal: &Principal,
) -> RegistryResult<Organization> {
    if principal.is_customer() {
        return Err(RegistryError::Denied(
            "the pull log is only available to vendors".to_owned(),
        ));
    }
    Ok(state.database().organization(principal.organization_id).await?)
}

#[tracing::instrument(skip_all)]
async fn list_pulls(
    State(state): State<RegistryState>,
    principal: Principal,
    RawQuery(query): RawQuery,
) -> RegistryResult<Json<Vec<ArtifactVersionPull>>> {
    let organization = vendor_organization(&state, &principal).await?;
    let query: PullsQuery = parse_query(query)?;
    let pulls = state
        .database()
        .query_pulls(
            organization.id,
            &query.filter(),
            query.count.unwrap_or(DEFAULT_COUNT),
        )
        .await?;
    Ok(Json(pulls))
}

#[tracing::instrument(skip_all)]
async fn filter_options(
    State(state): State<RegistryState>,
    principal: Principal,
) -> RegistryResult<Response> {
    let organization = vendor_organization(&state, &principal).await?;
    let options = state.database().pull_filter_options(organization.id).await?;
    Ok(Json(options).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionOptionsQuery {
    artifact_id: Uuid,
}

#[tracing::instrument(skip_all)]
async fn version_options(
    State(state): State<RegistryState>,
    principal: Principal,
    RawQuery(query): RawQuery,
) -> RegistryResult<Json<Vec<String>>> {
    let organization = vendor_organization(&state, &principal).await?;
    let query: VersionOptionsQuery = parse_query(query)?;
    let versions = state
        .database()
        .pull_version_options(organization.id, query.artifact_id)
        .await?;
    Ok(Json(versions))
}

#[tracing::instrument(skip_all)]
async fn export_pulls(
    State(state): State<RegistryState>,
    principal: Principal,
    RawQuery(query): RawQuery,
) -> RegistryResult<Response> {
    let organization = vendor_organization(&state, &principal).await?;
    let query: PullsQuery = parse_query(query)?;
    let rows = state.export().rows_for(&organization.plan);
    let pulls = state
        .database()
        .query_pulls(organization.id, &query.filter(), rows)
        .await?;
    tracing::debug!(rows = pulls.len(), plan = %organization.plan, "exporting pulls");

    let filename = format!("{}_artifact_pulls.csv", Utc::now().format("%Y-%m-%d"));
    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, "text/csv; charset=utf-8".to_owned()),
            (
                CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        to_csv(&pulls),
    )
        .into_response())
}

const CSV_HEADER: [&str; 7] = [
    "Date", "Customer", "User", "Email", "Address", "Artifact", "Version",
];

fn to_csv(pulls: &[ArtifactVersionPull]) -> String {
    let mut out = String::new();
    write_record(&mut out, CSV_HEADER);
    for pull in pulls {
        let date = pull.created_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        write_record(
            &mut out,
            [
                date.as_str(),
                pull.customer_organization_name.as_deref().unwrap_or_default(),
                pull.user_account_name.as_deref().unwrap_or_default(),
                pull.user_account_email.as_deref().unwrap_or_default(),
                pull.remote_address.as_deref().unwrap_or_default(),
                &pull.artifact_name,
                &pull.version_name,
            ],
        );
    }
    out
}

fn write_record<'a>(out: &mut String, fields: impl IntoIterator<Item = &'a str>) {
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if field.contains([',', '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out.push('\n');
}
