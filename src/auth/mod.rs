//! Authentication adapter
//!
//! The fabric never validates credentials itself; it hands the raw upgrade
//! request to an [`AuthAdapter`] and receives a verified [`Principal`] back.
//! The default adapter reads a bearer-style JWT from the `token` query
//! parameter, the `Authorization` header, or the `token` cookie, and
//! verifies the signature before admitting the connection. Deployments can
//! swap in mTLS or opaque session lookups by implementing the trait.

use async_trait::async_trait;
use axum::http::{header, HeaderMap, Uri};
use axum_extra::extract::cookie::CookieJar;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::envelope::{AccessLevel, Principal};
use crate::error::FabricError;

/// The parts of the HTTP upgrade request an adapter may inspect.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl UpgradeRequest {
    pub fn new(uri: Uri, headers: HeaderMap) -> Self {
        Self { uri, headers }
    }

    /// Locate the opaque token: query parameter first, then the
    /// `Authorization: Bearer` header, then the `token` cookie.
    pub fn bearer_token(&self) -> Option<String> {
        if let Some(query) = self.uri.query() {
            for pair in query.split('&') {
                if let Some((key, value)) = pair.split_once('=') {
                    if key == "token" && !value.is_empty() {
                        return Some(value.to_string());
                    }
                }
            }
        }

        if let Some(value) = self.headers.get(header::AUTHORIZATION) {
            if let Ok(raw) = value.to_str() {
                if let Some(token) = raw.strip_prefix("Bearer ") {
                    return Some(token.trim().to_string());
                }
            }
        }

        let jar = CookieJar::from_headers(&self.headers);
        jar.get("token").map(|c| c.value().to_string())
    }
}

/// Maps an upgrade request to a user identity, or rejects it.
#[async_trait]
pub trait AuthAdapter: Send + Sync {
    async fn authenticate(&self, request: &UpgradeRequest) -> Result<Principal, FabricError>;
}

/// JWT claims accepted by the default adapter.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    pub exp: i64,
}

/// Default bearer-token adapter. Verifies an HS256 JWT and maps its claims
/// to a principal.
pub struct BearerAuthAdapter {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl BearerAuthAdapter {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }
}

fn access_level_from_role(role: Option<&str>) -> AccessLevel {
    match role {
        Some("admin") => AccessLevel::Admin,
        Some("guest") => AccessLevel::Guest,
        _ => AccessLevel::User,
    }
}

#[async_trait]
impl AuthAdapter for BearerAuthAdapter {
    async fn authenticate(&self, request: &UpgradeRequest) -> Result<Principal, FabricError> {
        let token = request
            .bearer_token()
            .ok_or_else(|| FabricError::Auth("missing token".into()))?;

        let data = decode::<Claims>(&token, &self.decoding_key, &self.validation)
            .map_err(|e| FabricError::Auth(format!("token rejected: {e}")))?;

        let claims = data.claims;
        Ok(Principal {
            display_name: claims.name.unwrap_or_else(|| claims.sub.clone()),
            access_level: access_level_from_role(claims.role.as_deref()),
            user_id: claims.sub,
        })
    }
}
