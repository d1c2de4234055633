//! Bearer token authentication and org level authorisation
//!
//! Operators holding an admin scope may read any org. Everyone else may only
//! read orgs they manage or are billing manager of, and must name them.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ApiError;

/// Scopes granting read access to every org
pub const ADMIN_SCOPES: [&str; 3] = [
    "cloud_controller.admin",
    "cloud_controller.admin_read_only",
    "cloud_controller.global_auditor",
];

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no access token in request")]
    MissingToken,

    #[error("invalid Authorization header: {0}")]
    InvalidHeader(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("authorisation lookup failed: {0}")]
    Upstream(String),
}

/// Verified caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub scopes: Vec<String>,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.scopes.iter().any(|s| ADMIN_SCOPES.contains(&s.as_str()))
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verifies a bearer token
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;

    /// Orgs the caller manages or is billing manager of
    async fn billing_orgs(&self, identity: &Identity, token: &str) -> Result<HashSet<Uuid>, AuthError>;
}

/// Token from an `Authorization: Bearer <token>` header
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?
        .to_str()
        .map_err(|_| AuthError::InvalidHeader("not visible ASCII".to_string()))?;
    let mut parts = value.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(token), None) => {
            if !scheme.eq_ignore_ascii_case("bearer") {
                return Err(AuthError::InvalidHeader("unsupported type".to_string()));
            }
            if token.is_empty() {
                return Err(AuthError::InvalidHeader("missing bearer token data".to_string()));
            }
            Ok(token)
        }
        _ => Err(AuthError::InvalidHeader("expected '<type> <token>'".to_string())),
    }
}

async fn check_access(
    authenticator: &dyn Authenticator,
    headers: &HeaderMap,
    requested_orgs: &[Uuid],
) -> Result<Option<Identity>, AuthError> {
    let token = bearer_token(headers)?;
    let identity = authenticator.verify(token).await?;
    if identity.is_admin() {
        return Ok(Some(identity));
    }
    if requested_orgs.is_empty() {
        return Ok(None);
    }
    let allowed = authenticator.billing_orgs(&identity, token).await?;
    Ok(requested_orgs
        .iter()
        .all(|org| allowed.contains(org))
        .then_some(identity))
}

/// Admits admins for any request and billing managers for their own orgs.
/// A request without orgs reads every org and needs an admin.
pub async fn authorize(
    authenticator: &dyn Authenticator,
    headers: &HeaderMap,
    requested_orgs: &[Uuid],
) -> Result<Identity, ApiError> {
    match check_access(authenticator, headers, requested_orgs).await {
        Ok(Some(identity)) => Ok(identity),
        Ok(None) => {
            debug!(orgs = ?requested_orgs, "caller has no billing access to the requested orgs");
            Err(ApiError::Unauthorized)
        }
        Err(AuthError::Upstream(reason)) => {
            warn!(error = %reason, "authorisation lookup failed");
            Err(ApiError::Unauthorized)
        }
        Err(err) => {
            debug!(error = %err, "authentication failed");
            Err(ApiError::Unauthorized)
        }
    }
}

/// Fixed token table, for tests and for running without a UAA. An empty
/// table rejects every token.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthenticator {
    tokens: HashMap<String, (Identity, HashSet<Uuid>)>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_admin(mut self, token: &str) -> Self {
        let identity = Identity {
            user_id: format!("admin-{token}"),
            scopes: vec!["cloud_controller.admin".to_string()],
        };
        self.tokens.insert(token.to_string(), (identity, HashSet::new()));
        self
    }

    pub fn with_billing_manager(mut self, token: &str, orgs: impl IntoIterator<Item = Uuid>) -> Self {
        let identity = Identity {
            user_id: format!("user-{token}"),
            scopes: vec!["cloud_controller.read".to_string()],
        };
        self.tokens.insert(token.to_string(), (identity, orgs.into_iter().collect()));
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens
            .get(token)
            .map(|(identity, _)| identity.clone())
            .ok_or_else(|| AuthError::InvalidToken("unknown token".to_string()))
    }

    async fn billing_orgs(&self, identity: &Identity, token: &str) -> Result<HashSet<Uuid>, AuthError> {
        match self.tokens.get(token) {
            Some((known, orgs)) if known == identity => Ok(orgs.clone()),
            _ => Ok(HashSet::new()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TokenKey {
    #[serde(default)]
    kid: String,
    #[serde(default)]
    alg: String,
    /// PEM encoded public key
    value: String,
}

#[derive(Debug, Deserialize)]
struct TokenKeys {
    #[serde(default)]
    keys: Vec<TokenKey>,
}

#[derive(Debug, Deserialize)]
struct UaaClaims {
    user_id: String,
    #[serde(default)]
    scope: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OrgPage {
    #[serde(default)]
    next_url: Option<String>,
    #[serde(default)]
    resources: Vec<OrgResource>,
}

#[derive(Debug, Deserialize)]
struct OrgResource {
    metadata: OrgMetadata,
}

#[derive(Debug, Deserialize)]
struct OrgMetadata {
    guid: Uuid,
}

/// Verifies UAA issued RS256 tokens and looks up org roles in the Cloud
/// Foundry API with the caller's own token
pub struct UaaAuthenticator {
    token_keys_url: String,
    api_address: String,
    client: reqwest::Client,
    keys: RwLock<Vec<TokenKey>>,
}

fn upstream(context: &str, err: reqwest::Error) -> AuthError {
    AuthError::Upstream(format!("{context}: {err}"))
}

impl UaaAuthenticator {
    pub fn new(token_url: &str, api_address: &str) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| upstream("failed to build HTTP client", e))?;
        Ok(Self {
            token_keys_url: format!("{}/token_keys", token_url.trim_end_matches('/')),
            api_address: api_address.trim_end_matches('/').to_string(),
            client,
            keys: RwLock::new(Vec::new()),
        })
    }

    async fn fetch_keys(&self) -> Result<Vec<TokenKey>, AuthError> {
        let keys: TokenKeys = self
            .client
            .get(&self.token_keys_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| upstream("token_keys request failed", e))?
            .json()
            .await
            .map_err(|e| upstream("invalid token_keys response", e))?;
        debug!(count = keys.keys.len(), "Fetched token keys");
        Ok(keys.keys)
    }

    /// Key for `kid`, refetching the key set once on a miss to pick up
    /// rotated keys
    async fn key(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        let find = |keys: &[TokenKey]| {
            keys.iter()
                .find(|k| k.kid == kid && k.alg == "RS256")
                .map(|k| k.value.clone())
        };
        let cached = find(&self.keys.read().await);
        let pem = match cached {
            Some(pem) => pem,
            None => {
                let fresh = self.fetch_keys().await?;
                let pem = find(&fresh);
                *self.keys.write().await = fresh;
                pem.ok_or_else(|| AuthError::InvalidToken(format!("unable to find key '{kid}'")))?
            }
        };
        DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| AuthError::InvalidToken(e.to_string()))
    }

    async fn org_guids(&self, path: &str, token: &str) -> Result<Vec<Uuid>, AuthError> {
        let mut guids = Vec::new();
        let mut next = Some(path.to_string());
        while let Some(path) = next {
            let page: OrgPage = self
                .client
                .get(format!("{}{}", self.api_address, path))
                .bearer_auth(token)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| upstream("org lookup failed", e))?
                .json()
                .await
                .map_err(|e| upstream("invalid org list", e))?;
            guids.extend(page.resources.into_iter().map(|r| r.metadata.guid));
            next = page.next_url;
        }
        Ok(guids)
    }
}

#[async_trait]
impl Authenticator for UaaAuthenticator {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let header = decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::InvalidToken(format!("unsupported algorithm {:?}", header.alg)));
        }
        let kid = header
            .kid
            .ok_or_else(|| AuthError::InvalidToken("expecting a key ID in the kid field".to_string()))?;
        let key = self.key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false;
        let data = decode::<UaaClaims>(token, &key, &validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        Ok(Identity {
            user_id: data.claims.user_id,
            scopes: data.claims.scope,
        })
    }

    async fn billing_orgs(&self, identity: &Identity, token: &str) -> Result<HashSet<Uuid>, AuthError> {
        let mut orgs = HashSet::new();
        for role in ["billing_managed_organizations", "managed_organizations"] {
            let path = format!("/v2/users/{}/{role}", identity.user_id);
            orgs.extend(self.org_guids(&path, token).await?);
        }
        Ok(orgs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token(&headers("Bearer abc")).unwrap(), "abc");
        assert_eq!(bearer_token(&headers("bearer abc")).unwrap(), "abc");
        assert!(matches!(bearer_token(&HeaderMap::new()), Err(AuthError::MissingToken)));
        assert!(bearer_token(&headers("Basic abc")).is_err());
        assert!(bearer_token(&headers("Bearer")).is_err());
        assert!(bearer_token(&headers("Bearer a b")).is_err());
        assert!(bearer_token(&headers("Bearer ")).is_err());
    }

    #[test]
    fn test_admin_scopes() {
        let mut identity = Identity { user_id: "u".into(), scopes: vec!["cloud_controller.read".into()] };
        assert!(!identity.is_admin());
        identity.scopes.push("cloud_controller.global_auditor".into());
        assert!(identity.is_admin());
    }

    #[tokio::test]
    async fn test_authorize_rules() {
        let own = Uuid::from_u128(1);
        let other = Uuid::from_u128(2);
        let auth = StaticAuthenticator::new()
            .with_admin("admin")
            .with_billing_manager("manager", [own]);

        assert!(authorize(&auth, &headers("Bearer admin"), &[]).await.is_ok());
        assert!(authorize(&auth, &headers("Bearer admin"), &[other]).await.is_ok());
        assert!(authorize(&auth, &headers("Bearer manager"), &[own]).await.is_ok());
        assert!(matches!(
            authorize(&auth, &headers("Bearer manager"), &[own, other]).await,
            Err(ApiError::Unauthorized)
        ));
        assert!(matches!(
            authorize(&auth, &headers("Bearer manager"), &[]).await,
            Err(ApiError::Unauthorized)
        ));
        assert!(matches!(
            authorize(&auth, &headers("Bearer nobody"), &[own]).await,
            Err(ApiError::Unauthorized)
        ));
        assert!(matches!(authorize(&auth, &HeaderMap::new(), &[own]).await, Err(ApiError::Unauthorized)));
    }

    #[test]
    fn test_uaa_urls() {
        let auth = UaaAuthenticator::new("https://uaa.example.com/", "https://api.example.com/").unwrap();
        assert_eq!(auth.token_keys_url, "https://uaa.example.com/token_keys");
        assert_eq!(auth.api_address, "https://api.example.com");
    }

    #[tokio::test]
    async fn test_uaa_rejects_malformed_token() {
        let auth = UaaAuthenticator::new("https://uaa.example.com", "https://api.example.com").unwrap();
        assert!(matches!(auth.verify("not-a-jwt").await, Err(AuthError::InvalidToken(_))));
    }
}
