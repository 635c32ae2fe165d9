//! Bearer token validation.
//!
//! Token issuance belongs to the auth service; this module validates HS256
//! bearer tokens and exposes the caller as an [`AuthUser`] extractor. The
//! [`auth_context`] middleware runs ahead of the rate limiter and stashes
//! the verified identity in request extensions, so edge layers key off an
//! authenticated user id rather than anything client-supplied.

use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{ApiError, ServiceError};
use crate::AppState;

/// Claims we consume from the auth service's tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id).
    pub sub: String,
    /// Tenant tag, when multi-tenancy applies.
    pub tenant_id: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

/// Authenticated caller extracted from the bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub tenant_id: Option<String>,
}

/// Validates a raw bearer token against the shared secret.
pub fn verify_bearer(token: &str, secret: &str) -> Result<AuthUser, ServiceError> {
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| ServiceError::Unauthorized(format!("invalid bearer token: {}", e)))?;

    let user_id = Uuid::parse_str(&data.claims.sub)
        .map_err(|_| ServiceError::Unauthorized("token subject is not a user id".to_string()))?;

    Ok(AuthUser {
        user_id,
        tenant_id: data.claims.tenant_id,
    })
}

/// Pulls the bearer token out of an Authorization header value.
fn bearer_token(header: &str) -> Option<&str> {
    header.strip_prefix("Bearer ")
}

/// Middleware: validates the bearer token when present and inserts the
/// resulting [`AuthUser`] into request extensions. Never rejects on its
/// own; handlers still enforce auth through the extractor.
pub async fn auth_context(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let user = request
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .and_then(|token| verify_bearer(token, &state.config.jwt_secret).ok());
    if let Some(user) = user {
        request.extensions_mut().insert(user);
    }
    next.run(request).await
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        // The auth middleware already verified this request.
        if let Some(user) = parts.extensions.get::<AuthUser>() {
            return Ok(user.clone());
        }

        let header = parts
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ApiError(ServiceError::Unauthorized(
                    "missing authorization header".to_string(),
                ))
            })?;

        let token = bearer_token(header).ok_or_else(|| {
            ApiError(ServiceError::Unauthorized(
                "authorization header is not a bearer token".to_string(),
            ))
        })?;

        verify_bearer(token, &state.config.jwt_secret).map_err(ApiError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret-test-secret-test-secret!";

    fn mint(sub: &str, exp_offset: i64) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            tenant_id: Some("acme".to_string()),
            iat: now,
            exp: now + exp_offset,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn accepts_valid_token() {
        let user_id = Uuid::new_v4();
        let token = mint(&user_id.to_string(), 3600);
        let user = verify_bearer(&token, SECRET).unwrap();
        assert_eq!(user.user_id, user_id);
        assert_eq!(user.tenant_id.as_deref(), Some("acme"));
    }

    #[test]
    fn rejects_expired_token() {
        let token = mint(&Uuid::new_v4().to_string(), -3600);
        assert!(verify_bearer(&token, SECRET).is_err());
    }

    #[test]
    fn rejects_wrong_secret() {
        let token = mint(&Uuid::new_v4().to_string(), 3600);
        assert!(verify_bearer(&token, "another-secret-another-secret-12").is_err());
    }

    #[test]
    fn rejects_non_uuid_subject() {
        let token = mint("not-a-uuid", 3600);
        assert!(verify_bearer(&token, SECRET).is_err());
    }
}
