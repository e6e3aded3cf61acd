use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use serde::{Deserialize, Serialize};

use crate::auth::{Identity, IdentityVerifier};

/// Claims carried by a connection token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    pub sub: String,
    /// Display name shown to other users
    #[serde(default)]
    pub name: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        let display_name = if claims.name.is_empty() {
            claims.sub.clone()
        } else {
            claims.name
        };
        Identity {
            user_id: claims.sub,
            display_name,
        }
    }
}

/// Verifier stored in request extensions for the [`AuthUser`] extractor.
#[derive(Clone)]
pub struct VerifierExt(pub Arc<dyn IdentityVerifier>);

/// Authenticated caller of an HTTP route, from `Authorization: Bearer`.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Identity);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or(StatusCode::UNAUTHORIZED)?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or(StatusCode::UNAUTHORIZED)?;

        // Set by the middleware layer in routes.rs
        let verifier = parts
            .extensions
            .get::<VerifierExt>()
            .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;

        let identity = verifier.0.verify(token).map_err(|_| StatusCode::UNAUTHORIZED)?;
        Ok(AuthUser(identity))
    }
}
