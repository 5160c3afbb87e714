//! Who is making a request.
//!
//! Every handler receives the caller as an explicit [`Principal`] value,
//! extracted once per request by the configured [`Authenticator`].

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use uuid::Uuid;

use crate::api::RegistryState;
use crate::error::RegistryError;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// The authenticated caller of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// The tenant the caller acts within.
    pub organization_id: Uuid,
    /// The user, for interactive credentials.
    pub user_account_id: Option<Uuid>,
    /// Set when the caller is a customer of the tenant rather than the tenant itself.
    pub customer_organization_id: Option<Uuid>,
    /// Network address the request came from.
    pub remote_address: Option<String>,
}

impl Principal {
    /// A member of the tenant itself.
    pub fn vendor(organization_id: Uuid, user_account_id: Option<Uuid>) -> Self {
        Self {
            organization_id,
            user_account_id,
            customer_organization_id: None,
            remote_address: None,
        }
    }

    /// A member of one of the tenant's customers.
    pub fn customer(
        organization_id: Uuid,
        customer_organization_id: Uuid,
        user_account_id: Option<Uuid>,
    ) -> Self {
        Self {
            organization_id,
            user_account_id,
            customer_organization_id: Some(customer_organization_id),
            remote_address: None,
        }
    }

    /// Whether license enforcement applies to this caller.
    pub fn is_customer(&self) -> bool {
        self.customer_organization_id.is_some()
    }
}

/// Resolves request credentials to a principal.
#[async_trait::async_trait]
pub trait Authenticator: fmt::Debug + Send + Sync {
    /// The caller identified by `headers`, or `None` if the credentials are missing or unknown.
    async fn authenticate(&self, headers: &HeaderMap) -> Option<Principal>;
}

/// Authenticates static tokens, sent as a bearer token or as a basic auth password.
#[derive(Debug, Clone, Default)]
pub struct TokenAuthenticator {
    tokens: HashMap<String, Principal>,
}

impl TokenAuthenticator {
    /// An authenticator which accepts no tokens.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `principal`.
    pub fn with_token(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.tokens.insert(token.into(), principal);
        self
    }

    fn credential(headers: &HeaderMap) -> Option<String> {
        let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
        let (scheme, credential) = value.split_once(' ')?;
        let credential = credential.trim();

        if scheme.eq_ignore_ascii_case("bearer") {
            Some(credential.to_owned())
        } else if scheme.eq_ignore_ascii_case("basic") {
            let decoded = STANDARD.decode(credential).ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (_, password) = decoded.split_once(':')?;
            Some(password.to_owned())
        } else {
            None
        }
    }
}

#[async_trait::async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Option<Principal> {
        let token = Self::credential(headers)?;
        self.tokens.get(&token).cloned()
    }
}

fn remote_address(parts: &Parts) -> Option<String> {
    let forwarded = parts
        .headers
        .get(FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    match forwarded {
        Some(address) => Some(address.to_owned()),
        None => parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(peer)| peer.ip().to_string()),
    }
}

impl FromRequestParts<RegistryState> for Principal {
    type Rejection = RegistryError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &RegistryState,
    ) -> Result<Self, Self::Rejection> {
        let mut principal = state
            .authenticator()
            .authenticate(&parts.headers)
            .await
            .ok_or(RegistryError::Unauthorized)?;
        principal.remote_address = remote_address(parts);
        Ok(principal)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderValue, Request};

    use super::*;

    fn headers(authorization: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(authorization).unwrap());
        headers
    }

    #[tokio::test]
    async fn bearer_and_basic_tokens() {
        let vendor = Principal::vendor(Uuid::new_v4(), None);
        let auth = TokenAuthenticator::new().with_token("s3cret", vendor.clone());

        assert_eq!(
            auth.authenticate(&headers("Bearer s3cret")).await,
            Some(vendor.clone())
        );

        let basic = format!("Basic {}", STANDARD.encode("anyone:s3cret"));
        assert_eq!(auth.authenticate(&headers(&basic)).await, Some(vendor));

        assert_eq!(auth.authenticate(&headers("Bearer wrong")).await, None);
        assert_eq!(auth.authenticate(&headers("Digest s3cret")).await, None);
        assert_eq!(auth.authenticate(&HeaderMap::new()).await, None);
    }

    #[test]
    fn forwarded_address_wins() {
        let (mut parts, ()) = Request::builder()
            .header(FORWARDED_FOR, "203.0.113.7, 10.0.0.1")
            .body(())
            .unwrap()
            .into_parts();
        parts
            .extensions
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 2], 4000))));
        assert_eq!(remote_address(&parts).as_deref(), Some("203.0.113.7"));

        parts.headers.remove(FORWARDED_FOR);
        assert_eq!(remote_address(&parts).as_deref(), Some("10.0.0.2"));
    }
}
